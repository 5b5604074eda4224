//! Process-shared synchronization primitives.
//!
//! These structs are placed inside shared memory blocks and operated on
//! concurrently by unrelated processes. They carry no process-local state;
//! a freshly mapped view is usable immediately after the creating process
//! calls `init()`.

pub mod futex;
pub mod rwlock;
pub mod semaphore;

pub use rwlock::SharedRwLock;
pub use semaphore::SharedSemaphore;

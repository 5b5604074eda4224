//! Process-shared read/write lock.
//!
//! One `AtomicU32` state word (reader count, or a writer bit) plus a
//! wake-generation word the futex waiters sleep on. The lock lives inside
//! a shared memory block and is operated on by unrelated processes; it
//! holds no process-local state and is safe to use from any mapping of
//! the same physical page.
//!
//! Acquisition is try/timeout only at the API level - blocking callers
//! loop over bounded slices so a cooperative stop request is observed
//! between slices.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use static_assertions::const_assert_eq;

use super::futex::{futex_wait, futex_wake_all};

/// Writer-held marker in the state word.
const WRITER: u32 = 1 << 31;

/// Process-shared read/write lock (8 bytes, `#[repr(C)]`).
#[repr(C)]
pub struct SharedRwLock {
    /// 0 = free, [`WRITER`] = exclusively held, else reader count.
    state: AtomicU32,
    /// Wake generation. Bumped on every release; waiters sleep on it.
    wake: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<SharedRwLock>(), 8);

impl SharedRwLock {
    /// A fresh unlocked lock (for process-local embedding; shared blocks
    /// use [`SharedRwLock::init`] on zeroed memory instead).
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
            wake: AtomicU32::new(0),
        }
    }

    /// Initialize a lock in place. Called once by whichever process
    /// creates the enclosing shared block.
    pub fn init(&self) {
        self.state.store(0, Ordering::Release);
        self.wake.store(0, Ordering::Release);
    }

    /// Try to take a shared (read) acquisition. Never blocks.
    pub fn try_read(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & WRITER != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Try to take the exclusive (write) acquisition. Never blocks.
    pub fn try_write(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Take a shared acquisition, waiting up to `timeout`.
    pub fn read_timeout(&self, timeout: Duration) -> bool {
        self.acquire_timeout(timeout, |lock| lock.try_read())
    }

    /// Take the exclusive acquisition, waiting up to `timeout`.
    pub fn write_timeout(&self, timeout: Duration) -> bool {
        self.acquire_timeout(timeout, |lock| lock.try_write())
    }

    /// Release a shared acquisition.
    pub fn unlock_read(&self) {
        let previous = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous != 0 && previous & WRITER == 0);
        if previous == 1 {
            self.bump_and_wake();
        }
    }

    /// Release the exclusive acquisition.
    pub fn unlock_write(&self) {
        debug_assert_eq!(self.state.load(Ordering::Relaxed), WRITER);
        self.state.store(0, Ordering::Release);
        self.bump_and_wake();
    }

    /// Whether a writer currently holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Acquire) & WRITER != 0
    }

    fn bump_and_wake(&self) {
        self.wake.fetch_add(1, Ordering::AcqRel);
        futex_wake_all(&self.wake);
    }

    fn acquire_timeout(&self, timeout: Duration, mut try_acquire: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if try_acquire(self) {
                return true;
            }
            let generation = self.wake.load(Ordering::Acquire);
            // Re-check after reading the generation so a release between
            // the failed attempt and the wait cannot be missed.
            if try_acquire(self) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex_wait(&self.wake, generation, Some(deadline - now));
        }
    }
}

impl Default for SharedRwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fresh() -> SharedRwLock {
        SharedRwLock::new()
    }

    #[test]
    fn readers_share() {
        let lock = fresh();
        assert!(lock.try_read());
        assert!(lock.try_read());
        assert!(!lock.try_write());
        lock.unlock_read();
        lock.unlock_read();
        assert!(lock.try_write());
        lock.unlock_write();
    }

    #[test]
    fn writer_excludes_readers() {
        let lock = fresh();
        assert!(lock.try_write());
        assert!(!lock.try_read());
        assert!(!lock.try_write());
        assert!(lock.is_write_locked());
        lock.unlock_write();
        assert!(lock.try_read());
        lock.unlock_read();
    }

    #[test]
    fn write_timeout_expires_under_contention() {
        let lock = fresh();
        assert!(lock.try_read());
        let start = Instant::now();
        assert!(!lock.write_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
        lock.unlock_read();
    }

    #[test]
    fn blocked_writer_proceeds_after_release() {
        let lock = Arc::new(fresh());
        assert!(lock.try_read());

        let contender = Arc::clone(&lock);
        let handle = thread::spawn(move || contender.write_timeout(Duration::from_secs(2)));

        thread::sleep(Duration::from_millis(20));
        lock.unlock_read();

        assert!(handle.join().unwrap());
        lock.unlock_write();
    }
}

//! Process-shared counting semaphore.
//!
//! A single `AtomicU32` count that doubles as the futex word. Used for
//! the sporadic request/response protocol: requesters post the request
//! semaphore and wait on the response semaphore; the serving task drains
//! the request count in one atomic swap so bursts coalesce into a single
//! service cycle.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use static_assertions::const_assert_eq;

use super::futex::{futex_wait, futex_wake};

/// Process-shared counting semaphore (4 bytes, `#[repr(C)]`).
#[repr(C)]
pub struct SharedSemaphore {
    count: AtomicU32,
}

const_assert_eq!(core::mem::size_of::<SharedSemaphore>(), 4);

impl SharedSemaphore {
    /// A fresh semaphore with a zero count (for process-local embedding;
    /// shared blocks use [`SharedSemaphore::init`] on zeroed memory).
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Initialize the semaphore in place with a zero count.
    pub fn init(&self) {
        self.count.store(0, Ordering::Release);
    }

    /// Add `n` tokens and wake up to `n` waiters.
    pub fn post(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.count.fetch_add(n, Ordering::AcqRel);
        futex_wake(&self.count, n as i32);
    }

    /// Consume one token if any is available. Never blocks.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Consume one token, waiting up to `timeout` for one to be posted.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_wait() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex_wait(&self.count, 0, Some(deadline - now));
        }
    }

    /// Atomically consume every available token, returning how many there
    /// were. This is the request-coalescing drain: tokens posted while a
    /// cycle was in flight are absorbed into that one cycle.
    pub fn take_all(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Current token count (diagnostic; racy by nature).
    pub fn peek(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for SharedSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fresh() -> SharedSemaphore {
        SharedSemaphore::new()
    }

    #[test]
    fn try_wait_on_empty_fails() {
        let sem = fresh();
        assert!(!sem.try_wait());
    }

    #[test]
    fn post_then_wait() {
        let sem = fresh();
        sem.post(2);
        assert!(sem.try_wait());
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
    }

    #[test]
    fn take_all_drains() {
        let sem = fresh();
        sem.post(5);
        assert_eq!(sem.take_all(), 5);
        assert_eq!(sem.take_all(), 0);
        assert!(!sem.try_wait());
    }

    #[test]
    fn wait_timeout_expires() {
        let sem = fresh();
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn post_releases_waiter() {
        let sem = Arc::new(fresh());
        let waiter = Arc::clone(&sem);

        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(20));
        sem.post(1);

        assert!(handle.join().unwrap());
    }
}

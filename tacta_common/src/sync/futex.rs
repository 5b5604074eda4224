//! Linux futex wrapper for inter-process synchronization.
//!
//! Uses `FUTEX_WAIT` / `FUTEX_WAKE`, not the `_PRIVATE` variants: the
//! private forms only match waiters within one process and silently fail
//! to wake waiters in other processes. Every word waited on here lives in
//! shared memory mapped by multiple unrelated processes.

#[cfg(target_os = "linux")]
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Block until the word at `addr` changes away from `expected`, a wake
/// arrives, or `timeout` expires.
///
/// Returns `0` on wake (possibly spurious), `-1` with `EAGAIN` if the
/// current value already differs from `expected`, `-1` with `ETIMEDOUT`
/// on timeout.
///
/// For inter-process use `addr` must point into shared memory.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: the syscall only reads the u32 behind `addr`, which is valid
    // for the duration of the call because we hold a reference to it.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on the word at `addr`.
///
/// Returns the number of waiters woken, or -1 on error.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: the syscall only inspects the address; no memory is written.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake all waiters blocked on the word at `addr`.
#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

// Non-Linux fallback: bounded sleep. Correctness of the callers does not
// depend on wakeups, only on re-checking the protected word.

/// Fallback wait: bounded sleep, then let the caller re-check.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    let nap = timeout.unwrap_or(Duration::from_millis(1));
    std::thread::sleep(nap.min(Duration::from_millis(10)));
    0
}

/// Fallback wake: no-op; waiters recheck on their own schedule.
#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

/// Fallback wake-all: no-op.
#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;

    #[test]
    fn wake_without_waiters_is_harmless() {
        let word = AtomicU32::new(0);
        assert!(futex_wake(&word, 1) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_with_stale_expected_returns_immediately() {
        let word = AtomicU32::new(42);
        let rc = futex_wait(&word, 0, Some(Duration::from_millis(100)));
        assert_eq!(rc, -1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_times_out() {
        let word = AtomicU32::new(7);
        let start = std::time::Instant::now();
        let _ = futex_wait(&word, 7, Some(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = Arc::clone(&word);

        let handle = thread::spawn(move || {
            while waiter.load(Ordering::Acquire) == 0 {
                futex_wait(&waiter, 0, Some(Duration::from_secs(1)));
            }
            waiter.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        word.store(9, Ordering::Release);
        futex_wake(&word, 1);

        assert_eq!(handle.join().unwrap(), 9);
    }
}

//! Task control and real-time pacing.
//!
//! One OS thread per writer/reader task. Cancellation is cooperative: the
//! stop flag is checked at every suspension point, and teardown always
//! signals-then-waits so shared locks are never released under a task
//! still using them. Periodic tasks pace on absolute monotonic time so
//! period drift does not accumulate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{FabricError, FabricResult};

/// Control flags shared between a task and its owning handle.
#[derive(Debug, Default)]
pub struct TaskControl {
    /// Task must exit at the next suspension point.
    pub must_stop: AtomicBool,
    /// Task must skip its callback and idle.
    pub must_pause: AtomicBool,
    /// Task acknowledged the pause request.
    pub paused: AtomicBool,
    /// Task is alive (set before the loop, cleared on exit).
    pub running: AtomicBool,
}

impl TaskControl {
    /// Fresh control block, all flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stop has been requested.
    #[inline]
    pub fn stopping(&self) -> bool {
        self.must_stop.load(Ordering::Acquire)
    }

    /// Whether a pause has been requested.
    #[inline]
    pub fn pause_requested(&self) -> bool {
        self.must_pause.load(Ordering::Acquire)
    }

    /// Request the task to stop.
    pub fn request_stop(&self) {
        self.must_stop.store(true, Ordering::Release);
    }

    /// Request the task to pause. Idempotent.
    pub fn request_pause(&self) {
        self.must_pause.store(true, Ordering::Release);
    }

    /// Clear a pause request. Idempotent.
    pub fn request_resume(&self) {
        self.must_pause.store(false, Ordering::Release);
    }

    /// Whether the task thread is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the task acknowledged a pause request.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

/// Wait until `control.running` clears, up to `timeout`.
///
/// Used by teardown after signalling `must_stop`; the wait is bounded so a
/// wedged task surfaces as an error instead of a hang.
pub fn wait_for_termination(control: &TaskControl, timeout: Duration) -> FabricResult<()> {
    let deadline = Instant::now() + timeout;
    while control.is_running() {
        if Instant::now() >= deadline {
            return Err(FabricError::Cancelled {
                reason: "task did not stop within the bounded wait".to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Wait until `control.running` is set, up to `timeout`.
///
/// Registration paths use this before invoking the caller's init hook,
/// which the contract says runs after the task is live.
pub fn wait_for_startup(control: &TaskControl, timeout: Duration) -> FabricResult<()> {
    let deadline = Instant::now() + timeout;
    while !control.is_running() {
        if Instant::now() >= deadline {
            return Err(FabricError::Cancelled {
                reason: "task did not start within the bounded wait".to_string(),
            });
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

/// Current monotonic time in nanoseconds.
#[cfg(target_os = "linux")]
pub fn now_monotonic_ns() -> u64 {
    use nix::time::{clock_gettime, ClockId};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(_) => 0,
    }
}

/// Current monotonic time in nanoseconds (portable fallback).
#[cfg(not(target_os = "linux"))]
pub fn now_monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Absolute-time periodic pacer.
///
/// Wake times advance by exactly one period per cycle regardless of how
/// long the cycle body took, so jitter does not accumulate into drift.
pub struct PeriodPacer {
    period: Duration,
    #[cfg(target_os = "linux")]
    next_wake: nix::sys::time::TimeSpec,
    #[cfg(not(target_os = "linux"))]
    next_wake: Instant,
}

impl PeriodPacer {
    /// Start a pacer whose first wake is one period from now.
    pub fn new(period: Duration) -> Self {
        #[cfg(target_os = "linux")]
        {
            use nix::time::{clock_gettime, ClockId};
            let now = clock_gettime(ClockId::CLOCK_MONOTONIC)
                .unwrap_or(nix::sys::time::TimeSpec::new(0, 0));
            Self {
                period,
                next_wake: now,
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self {
                period,
                next_wake: Instant::now(),
            }
        }
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time remaining until the next wake boundary. Zero once the
    /// boundary has passed.
    pub fn remaining(&self) -> Duration {
        #[cfg(target_os = "linux")]
        {
            use nix::time::{clock_gettime, ClockId};
            let Ok(now) = clock_gettime(ClockId::CLOCK_MONOTONIC) else {
                return Duration::ZERO;
            };
            let target = timespec_add_ns(self.next_wake, self.period.as_nanos() as i64);
            let diff = timespec_diff_ns(&target, &now);
            if diff <= 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(diff as u64)
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            (self.next_wake + self.period).saturating_duration_since(Instant::now())
        }
    }

    /// Sleep until the next period boundary (absolute time).
    pub fn wait(&mut self) {
        #[cfg(target_os = "linux")]
        {
            use nix::time::{clock_nanosleep, ClockId, ClockNanosleepFlags};
            self.next_wake = timespec_add_ns(self.next_wake, self.period.as_nanos() as i64);
            let _ = clock_nanosleep(
                ClockId::CLOCK_MONOTONIC,
                ClockNanosleepFlags::TIMER_ABSTIME,
                &self.next_wake,
            );
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.next_wake += self.period;
            let now = Instant::now();
            if self.next_wake > now {
                std::thread::sleep(self.next_wake - now);
            }
        }
    }
}

/// Add nanoseconds to a timespec, normalizing the nanosecond field.
#[cfg(target_os = "linux")]
fn timespec_add_ns(ts: nix::sys::time::TimeSpec, ns: i64) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    let mut secs = ts.tv_sec();
    let mut nanos = ts.tv_nsec() + ns;
    while nanos >= 1_000_000_000 {
        secs += 1;
        nanos -= 1_000_000_000;
    }
    while nanos < 0 {
        secs -= 1;
        nanos += 1_000_000_000;
    }
    TimeSpec::new(secs, nanos)
}

/// Compute the difference (a - b) in nanoseconds.
#[cfg(target_os = "linux")]
fn timespec_diff_ns(a: &nix::sys::time::TimeSpec, b: &nix::sys::time::TimeSpec) -> i64 {
    (a.tv_sec() - b.tv_sec()) * 1_000_000_000 + (a.tv_nsec() - b.tv_nsec())
}

/// Best-effort `SCHED_FIFO` elevation for the current thread.
///
/// Failure (missing privileges, non-RT kernel) is tolerated: the task
/// runs under the default scheduler and a warning is logged once.
pub fn try_elevate_rt(priority: i32) {
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: plain syscall on the current thread with a valid param.
        let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if ret != 0 {
            tracing::warn!(
                "SCHED_FIFO({priority}) unavailable: {}; continuing without RT priority",
                std::io::Error::last_os_error()
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flag_transitions() {
        let control = TaskControl::new();
        assert!(!control.stopping());
        control.request_pause();
        assert!(control.pause_requested());
        control.request_resume();
        assert!(!control.pause_requested());
        control.request_stop();
        assert!(control.stopping());
    }

    #[test]
    fn termination_wait_times_out_on_running_task() {
        let control = TaskControl::new();
        control.running.store(true, Ordering::Release);
        assert!(wait_for_termination(&control, Duration::from_millis(30)).is_err());
        control.running.store(false, Ordering::Release);
        assert!(wait_for_termination(&control, Duration::from_millis(30)).is_ok());
    }

    #[test]
    fn pacer_waits_roughly_one_period() {
        let mut pacer = PeriodPacer::new(Duration::from_millis(20));
        let start = Instant::now();
        pacer.wait();
        pacer.wait();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(200), "elapsed {elapsed:?}");
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_monotonic_ns();
        std::thread::sleep(Duration::from_millis(5));
        let b = now_monotonic_ns();
        assert!(b > a);
    }
}

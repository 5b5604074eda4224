//! Writer engine: the per-producer acquisition task and its handle.
//!
//! One OS task per writer, owning the write side of the swap protocol.
//! Periodic writers pace on absolute monotonic time; sporadic writers
//! block on their request semaphore and coalesce bursts into single write
//! cycles. Multi-buffer writers hold the write lock of the buffer being
//! filled across cycles and swap by acquiring the next buffer's lock
//! before releasing the current one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tacta::naming::truncate_prefix;
use tracing::{debug, error, warn};

use crate::buffers::BufferSet;
use crate::error::{FabricError, FabricResult};
use crate::hooks::{CleanFn, LifecycleHooks, WriteCycle, WriteFn};
use crate::registry::Registry;
use crate::stats::TaskStatistics;
use crate::task::{
    now_monotonic_ns, try_elevate_rt, wait_for_startup, wait_for_termination, PeriodPacer,
    TaskControl,
};

/// RT priority requested for writer tasks (best effort).
const WRITER_RT_PRIORITY: i32 = 60;

/// Scheduling discipline of a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterSchedule {
    /// Fixed-period task.
    Periodic(Duration),
    /// Runs only when requested through the request semaphore.
    Sporadic,
}

impl WriterSchedule {
    /// Period in microseconds; 0 encodes sporadic in the registry.
    pub fn period_us(&self) -> u64 {
        match self {
            WriterSchedule::Periodic(p) => p.as_micros() as u64,
            WriterSchedule::Sporadic => 0,
        }
    }

    /// Whether this schedule is sporadic.
    pub fn is_sporadic(&self) -> bool {
        matches!(self, WriterSchedule::Sporadic)
    }

    /// Reconstruct a schedule from a registry period field.
    pub fn from_period_us(period_us: u64) -> Self {
        if period_us == 0 {
            WriterSchedule::Sporadic
        } else {
            WriterSchedule::Periodic(Duration::from_micros(period_us))
        }
    }
}

/// Creation attributes of a writer.
#[derive(Debug, Clone)]
pub struct WriterAttrs {
    /// Name prefix (truncated to the registry limit on use).
    pub name: String,
    /// Size of one buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers.
    pub buffer_count: usize,
    /// Scheduling discipline.
    pub schedule: WriterSchedule,
}

impl WriterAttrs {
    /// The truncated name prefix actually used for registry slots and
    /// derived resource names.
    pub fn prefix(&self) -> &str {
        truncate_prefix(&self.name)
    }

    /// Validate the attributes.
    pub fn validate(&self) -> FabricResult<()> {
        if self.name.is_empty() {
            return Err(FabricError::InvalidArgument {
                reason: "writer name must not be empty".to_string(),
            });
        }
        if let WriterSchedule::Periodic(p) = self.schedule {
            if p.is_zero() {
                return Err(FabricError::InvalidArgument {
                    reason: "periodic writer period must be nonzero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// State shared between a writer handle and its task thread.
pub(crate) struct WriterShared {
    pub(crate) attrs: WriterAttrs,
    pub(crate) control: TaskControl,
    pub(crate) buffers: BufferSet,
    pub(crate) registry: Arc<Registry>,
    pub(crate) slot: usize,
    pub(crate) stats: Mutex<TaskStatistics>,
}

/// Whether a created object entered a fresh registry slot or revived an
/// inactive one. Revival is informational, not an error: the caller gets
/// a working handle either way and may skip re-initializing external
/// state when revived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// A fresh slot was claimed and new resources were created.
    Fresh,
    /// An inactive same-name slot with compatible attributes was re-entered.
    Revived,
}

/// A live producer: the owning handle of one writer task.
///
/// A handle may also be an *alias*: the result of registering the same
/// name with compatible attributes while the owning process's task is
/// still active. An alias shares the producer's buffers and semaphores
/// but spawns no task of its own; its pause/resume flags affect nothing,
/// and its teardown never deactivates the producer.
pub struct Writer {
    shared: Arc<WriterShared>,
    task: Option<JoinHandle<()>>,
    clean: Option<CleanFn>,
    provenance: Provenance,
    alias: bool,
    torn_down: bool,
}

impl Writer {
    /// Spawn the writer task and invoke the init hook once it is running.
    pub(crate) fn spawn(
        shared: Arc<WriterShared>,
        write_fn: WriteFn,
        hooks: LifecycleHooks,
        provenance: Provenance,
    ) -> FabricResult<Self> {
        let task_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("tacta-wr-{}", shared.attrs.prefix()))
            .spawn(move || writer_task(task_shared, write_fn))
            .map_err(|e| FabricError::Io { source: e })?;

        if let Err(e) = wait_for_startup(&shared.control, shared.registry.tuning().stop_wait()) {
            shared.control.request_stop();
            let _ = thread.join();
            return Err(e);
        }

        let writer = Self {
            shared,
            task: Some(thread),
            clean: hooks.clean,
            provenance,
            alias: false,
            torn_down: false,
        };
        if let Some(init) = hooks.init {
            init();
        }
        Ok(writer)
    }

    /// Build an alias handle onto an already-active producer. No task is
    /// spawned; the init hook runs immediately.
    pub(crate) fn attach_alias(shared: Arc<WriterShared>, hooks: LifecycleHooks) -> Self {
        let writer = Self {
            shared,
            task: None,
            clean: hooks.clean,
            provenance: Provenance::Revived,
            alias: true,
            torn_down: false,
        };
        if let Some(init) = hooks.init {
            init();
        }
        writer
    }

    /// Whether this handle aliases a producer owned by another process.
    pub fn is_alias(&self) -> bool {
        self.alias
    }

    /// The writer's (truncated) name prefix.
    pub fn name(&self) -> &str {
        self.shared.attrs.prefix()
    }

    /// The creation attributes.
    pub fn attrs(&self) -> &WriterAttrs {
        &self.shared.attrs
    }

    /// Whether this handle revived an existing registry slot.
    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    /// Whether the producer is active in the registry.
    pub fn is_active(&self) -> bool {
        self.shared
            .registry
            .producer_atomic(self.shared.slot)
            .active
            .load(Ordering::Acquire)
            != 0
    }

    /// Whether the last write callback reported failure.
    pub fn is_bad(&self) -> bool {
        self.shared
            .registry
            .producer_atomic(self.shared.slot)
            .bad
            .load(Ordering::Acquire)
            != 0
    }

    /// Request the task to pause. Idempotent.
    pub fn pause(&self) {
        self.shared.control.request_pause();
    }

    /// Clear a pause request. Idempotent.
    pub fn resume(&self) {
        self.shared.control.request_resume();
    }

    /// Whether the task has acknowledged a pause request.
    pub fn is_paused(&self) -> bool {
        self.shared.control.is_paused()
    }

    /// Snapshot of the task's statistics.
    pub fn statistics(&self) -> TaskStatistics {
        *self.shared.stats.lock()
    }

    /// Fire a request and wait for the resulting write to complete.
    /// Sporadic writers only.
    pub fn request(&self, timeout: Duration) -> FabricResult<()> {
        self.request_nonblocking()?;
        self.await_response(timeout)
    }

    /// Fire a request without waiting. Sporadic writers only.
    pub fn request_nonblocking(&self) -> FabricResult<()> {
        let req = self
            .shared
            .buffers
            .request_sem()
            .ok_or_else(not_sporadic)?;
        req.post(1);
        Ok(())
    }

    /// Wait for a previously fired request's write to complete.
    /// Sporadic writers only.
    pub fn await_response(&self, timeout: Duration) -> FabricResult<()> {
        let res = self
            .shared
            .buffers
            .response_sem()
            .ok_or_else(not_sporadic)?;
        if res.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(FabricError::Cancelled {
                reason: "timed out waiting for a sporadic write response".to_string(),
            })
        }
    }

    /// The registry slot index backing this writer.
    pub(crate) fn slot(&self) -> usize {
        self.shared.slot
    }

    /// Install the clean hook after a successful build sequence.
    pub(crate) fn set_clean(&mut self, clean: Option<CleanFn>) {
        self.clean = clean;
    }

    /// Full teardown: mark inactive, signal-then-wait the task, release
    /// or retain the shared resources, invoke the clean hook.
    ///
    /// The producer record stays claimed (inactive, revivable) while
    /// readers remain attached; the last reader to detach frees it.
    pub(crate) fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if self.alias {
            // The producer belongs to another process; just release our
            // view of it.
            if let Some(clean) = self.clean.take() {
                clean();
            }
            return;
        }

        let shared = &self.shared;
        let tuning = shared.registry.tuning();

        // Data becomes invisible to attaching readers immediately, before
        // the task stops.
        match shared.registry.global_write() {
            Ok(guard) => guard
                .producer_mut(self.shared.slot)
                .active
                .store(0, Ordering::Release),
            Err(e) => warn!("writer {} teardown: {e}", self.name()),
        }

        shared.control.request_stop();
        if let Some(req) = shared.buffers.request_sem() {
            // Wake a sporadic task blocked on its request semaphore; it
            // observes the stop flag before writing.
            req.post(1);
        }
        if wait_for_termination(&shared.control, tuning.stop_wait()).is_err() {
            error!("writer {} task did not stop in time", self.name());
        }
        if let Some(handle) = self.task.take() {
            let _ = handle.join();
        }

        let mut release_family = false;
        match shared.registry.global_write() {
            Ok(guard) => {
                let record = guard.producer_mut(self.shared.slot);
                if record.readers_attached.load(Ordering::Acquire) == 0 {
                    record.clear();
                    release_family = true;
                }
            }
            Err(e) => warn!("writer {} slot release: {e}", self.name()),
        }
        if release_family {
            shared.buffers.unlink_all();
            debug!("writer {} removed, slot freed", self.name());
        } else {
            shared.buffers.disown_all();
            debug!("writer {} removed, slot kept for revival", self.name());
        }

        if let Some(clean) = self.clean.take() {
            clean();
        }
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn not_sporadic() -> FabricError {
    FabricError::InvalidArgument {
        reason: "request/response requires a sporadic writer".to_string(),
    }
}

/// The acquisition task body.
fn writer_task(shared: Arc<WriterShared>, mut write_fn: WriteFn) {
    let tuning = *shared.registry.tuning();
    let control = &shared.control;
    let buffers = &shared.buffers;
    let header = buffers.header();
    let count = buffers.buffer_count();
    let multi = count > 1;
    let schedule = shared.attrs.schedule;
    let sporadic = schedule.is_sporadic();

    try_elevate_rt(WRITER_RT_PRIORITY);
    control.running.store(true, Ordering::Release);

    let mut pacer = match schedule {
        WriterSchedule::Periodic(p) => Some(PeriodPacer::new(p)),
        WriterSchedule::Sporadic => None,
    };

    // The buffer being filled. Multi-buffer tasks hold its write lock
    // across cycles; the initial acquisition happens here.
    let mut writing: usize = header.writing.load(Ordering::Acquire) as usize % count;
    let mut holding = false;
    if multi {
        while !control.stopping() {
            if buffers.lock(writing).write_timeout(tuning.wait_slice()) {
                holding = true;
                break;
            }
        }
    }

    let mut pending_swap = false;
    let mut last_published: Option<usize> = initial_published(header, count);

    while !control.stopping() {
        // A swap left over from the previous cycle is retried before
        // anything else.
        if pending_swap {
            if try_swap(buffers, header, &mut writing) {
                pending_swap = false;
            }
        }

        if control.pause_requested() {
            control.paused.store(true, Ordering::Release);
            std::thread::sleep(tuning.pause_poll());
            continue;
        }
        if control.is_paused() {
            control.paused.store(false, Ordering::Release);
            // Re-anchor so the pause gap is not treated as missed cycles.
            if let WriterSchedule::Periodic(p) = schedule {
                pacer = Some(PeriodPacer::new(p));
            }
        }

        if sporadic {
            let Some(req) = buffers.request_sem() else {
                break;
            };
            if !req.wait_timeout(tuning.wait_slice()) {
                continue;
            }
            if control.stopping() {
                break;
            }
        }

        if !multi {
            // Single buffer: lock for the duration of one write.
            if !acquire_write_interruptible(buffers, 0, control, &tuning) {
                break;
            }
            holding = true;
        } else if !holding {
            // Initial acquisition failed against stop; cannot write.
            break;
        }

        let started = Instant::now();
        let cycle = WriteCycle {
            buffer_index: writing,
            buffer_count: count,
            last_written: last_published,
            set: buffers,
        };
        // SAFETY: the write lock on `writing` is held.
        let good = write_fn(unsafe { buffers.buffer_mut(writing) }, &cycle);
        let elapsed = started.elapsed();

        shared
            .registry
            .producer_atomic(shared.slot)
            .bad
            .store(!good as u8, Ordering::Release);

        let now_ns = now_monotonic_ns();
        header.write_stamp_ns[writing].store(now_ns, Ordering::Release);
        if let WriterSchedule::Periodic(p) = schedule {
            header
                .next_swap_ns
                .store(now_ns + p.as_nanos() as u64, Ordering::Release);
        }

        if !multi {
            // The sole buffer is always the published one.
            last_published = Some(0);
            buffers.lock(0).unlock_write();
            holding = false;
        } else {
            pending_swap = !swap_with_budget(
                buffers,
                header,
                &mut writing,
                &schedule,
                pacer.as_ref(),
                control,
                &tuning,
            );
            if pending_swap {
                if let Some(mut stats) = shared.stats.try_lock() {
                    stats.swap_skips += 1;
                }
            } else {
                last_published = Some(header.last_written.load(Ordering::Acquire) as usize);
            }
        }

        // Best-effort: never block shutdown on the statistics lock.
        if let Some(mut stats) = shared.stats.try_lock() {
            stats.record(elapsed);
        }

        if sporadic {
            // Requests that arrived during this write coalesce into it.
            if let (Some(req), Some(res)) = (buffers.request_sem(), buffers.response_sem()) {
                let extra = req.take_all();
                res.post(1 + extra);
            }
        }

        if let Some(pacer) = pacer.as_mut() {
            pacer.wait();
        }
    }

    if holding {
        buffers.lock(writing).unlock_write();
    }
    control.paused.store(false, Ordering::Release);
    control.running.store(false, Ordering::Release);
}

/// Reconstruct the published-buffer state after a revival: a nonzero
/// stamp on the recorded last-written buffer means it holds real data.
fn initial_published(header: &tacta::DataHeader, count: usize) -> Option<usize> {
    let last = header.last_written.load(Ordering::Acquire) as usize % count;
    if header.stamp(last) != 0 {
        Some(last)
    } else {
        None
    }
}

/// One non-blocking swap attempt: acquire the next buffer, publish the
/// current one, release it.
fn try_swap(buffers: &BufferSet, header: &tacta::DataHeader, writing: &mut usize) -> bool {
    let next = (*writing + 1) % buffers.buffer_count();
    if !buffers.lock(next).try_write() {
        return false;
    }
    header.last_written.store(*writing as u32, Ordering::Release);
    buffers.lock(*writing).unlock_write();
    *writing = next;
    header.writing.store(next as u32, Ordering::Release);
    true
}

/// Retry a swap within the discipline's budget.
///
/// Periodic: retry until less than the configured margin remains in the
/// period, then give up for this cycle (the retry resumes next period).
/// Sporadic: retry until stopped. Returns whether the swap completed.
fn swap_with_budget(
    buffers: &BufferSet,
    header: &tacta::DataHeader,
    writing: &mut usize,
    schedule: &WriterSchedule,
    pacer: Option<&PeriodPacer>,
    control: &TaskControl,
    tuning: &tacta::TuningConfig,
) -> bool {
    loop {
        if try_swap(buffers, header, writing) {
            return true;
        }
        match schedule {
            WriterSchedule::Periodic(_) => {
                let remaining = pacer.map(|p| p.remaining()).unwrap_or(Duration::ZERO);
                if remaining < tuning.swap_retry_margin() {
                    return false;
                }
                std::thread::yield_now();
            }
            WriterSchedule::Sporadic => {
                if control.stopping() {
                    return false;
                }
                std::thread::sleep(tuning.soft_sleep());
            }
        }
    }
}

/// Blocking write-lock acquisition in interruptible slices.
fn acquire_write_interruptible(
    buffers: &BufferSet,
    index: usize,
    control: &TaskControl,
    tuning: &tacta::TuningConfig,
) -> bool {
    loop {
        if buffers.lock(index).write_timeout(tuning.wait_slice()) {
            return true;
        }
        if control.stopping() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_period_roundtrip() {
        let periodic = WriterSchedule::Periodic(Duration::from_millis(5));
        assert_eq!(periodic.period_us(), 5_000);
        assert_eq!(WriterSchedule::from_period_us(5_000), periodic);
        assert_eq!(
            WriterSchedule::from_period_us(0),
            WriterSchedule::Sporadic
        );
        assert!(WriterSchedule::Sporadic.is_sporadic());
    }

    #[test]
    fn attrs_validation() {
        let mut attrs = WriterAttrs {
            name: String::new(),
            buffer_size: 64,
            buffer_count: 1,
            schedule: WriterSchedule::Periodic(Duration::from_millis(1)),
        };
        assert!(attrs.validate().is_err());
        attrs.name = "palm".to_string();
        assert!(attrs.validate().is_ok());
        attrs.schedule = WriterSchedule::Periodic(Duration::ZERO);
        assert!(attrs.validate().is_err());
    }
}

//! Reader engine: the per-consumer acquisition task and its handle.
//!
//! One algorithm serves every combination of writer discipline (periodic
//! or sporadic), reader discipline (periodic, sporadic or soft) and
//! buffer count. The reader never takes a registry lock on its hot path;
//! liveness and freshness come from the producer record's atomic fields
//! and the data header's swap-protocol state.
//!
//! Soft readers must run at strictly lower scheduling priority than any
//! hard reader sharing the same producer; they receive no RT elevation
//! here.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tacta::naming::truncate_prefix;
use tacta::sync::SharedSemaphore;
use tacta::DataHeader;
use tracing::{debug, error, warn};

use crate::buffers::BufferSet;
use crate::error::{FabricError, FabricResult};
use crate::hooks::{CleanFn, LifecycleHooks, ReadCycle, ReadFn};
use crate::registry::Registry;
use crate::stats::TaskStatistics;
use crate::task::{
    now_monotonic_ns, try_elevate_rt, wait_for_startup, wait_for_termination, PeriodPacer,
    TaskControl,
};
use crate::writer::WriterSchedule;

/// RT priority requested for hard (periodic/sporadic) reader tasks.
const READER_RT_PRIORITY: i32 = 55;

/// Scheduling discipline of a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderSchedule {
    /// Fixed-period task.
    Periodic(Duration),
    /// Runs only when requested.
    Sporadic,
    /// Best-effort loop with no deadline, lowest priority class.
    Soft,
}

impl ReaderSchedule {
    /// Whether this schedule is sporadic.
    pub fn is_sporadic(&self) -> bool {
        matches!(self, ReaderSchedule::Sporadic)
    }
}

/// Attachment attributes of a reader.
#[derive(Debug, Clone)]
pub struct ReaderAttrs {
    /// Producer name prefix to attach to.
    pub name: String,
    /// Scheduling discipline.
    pub schedule: ReaderSchedule,
}

impl ReaderAttrs {
    /// The truncated name prefix used for lookup.
    pub fn prefix(&self) -> &str {
        truncate_prefix(&self.name)
    }

    /// Validate the attributes.
    pub fn validate(&self) -> FabricResult<()> {
        if self.name.is_empty() {
            return Err(FabricError::InvalidArgument {
                reason: "reader target name must not be empty".to_string(),
            });
        }
        if let ReaderSchedule::Periodic(p) = self.schedule {
            if p.is_zero() {
                return Err(FabricError::InvalidArgument {
                    reason: "periodic reader period must be nonzero".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Snapshot of the attached producer's attributes, for `get_attr`-style
/// introspection.
#[derive(Debug, Clone, Copy)]
pub struct ProducerView {
    /// Size of one buffer in bytes.
    pub buffer_size: usize,
    /// Number of buffers.
    pub buffer_count: usize,
    /// Writer period in microseconds (0 = sporadic).
    pub period_us: u64,
    /// Whether the producer is currently active.
    pub active: bool,
    /// Whether the producer's last write reported failure.
    pub bad: bool,
}

/// State shared between a reader handle and its task thread.
pub(crate) struct ReaderShared {
    pub(crate) attrs: ReaderAttrs,
    pub(crate) control: TaskControl,
    pub(crate) buffers: BufferSet,
    pub(crate) registry: Arc<Registry>,
    pub(crate) slot: usize,
    pub(crate) writer_period_us: u64,
    pub(crate) stats: Mutex<TaskStatistics>,
    /// The reader's own request/response pair, process-local.
    pub(crate) request: SharedSemaphore,
    pub(crate) response: SharedSemaphore,
}

/// A live consumer: the owning handle of one reader task.
pub struct Reader {
    shared: Arc<ReaderShared>,
    task: Option<JoinHandle<()>>,
    clean: Option<CleanFn>,
    torn_down: bool,
}

impl Reader {
    /// Spawn the reader task and invoke the init hook once it is running.
    pub(crate) fn spawn(
        shared: Arc<ReaderShared>,
        read_fn: ReadFn,
        hooks: LifecycleHooks,
    ) -> FabricResult<Self> {
        let task_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(format!("tacta-rd-{}", shared.attrs.prefix()))
            .spawn(move || reader_task(task_shared, read_fn))
            .map_err(|e| FabricError::Io { source: e })?;

        if let Err(e) = wait_for_startup(&shared.control, shared.registry.tuning().stop_wait()) {
            shared.control.request_stop();
            let _ = thread.join();
            return Err(e);
        }

        let reader = Self {
            shared,
            task: Some(thread),
            clean: hooks.clean,
            torn_down: false,
        };
        if let Some(init) = hooks.init {
            init();
        }
        Ok(reader)
    }

    /// The attached producer's (truncated) name prefix.
    pub fn name(&self) -> &str {
        self.shared.attrs.prefix()
    }

    /// The attachment attributes.
    pub fn attrs(&self) -> &ReaderAttrs {
        &self.shared.attrs
    }

    /// Snapshot of the attached producer's attributes.
    pub fn producer(&self) -> ProducerView {
        let record = self.shared.registry.producer_atomic(self.shared.slot);
        ProducerView {
            buffer_size: self.shared.buffers.buffer_size(),
            buffer_count: self.shared.buffers.buffer_count(),
            period_us: self.shared.writer_period_us,
            active: record.active.load(Ordering::Acquire) != 0,
            bad: record.bad.load(Ordering::Acquire) != 0,
        }
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

    /// Fire a read request and wait for the cycle to complete.
    /// Sporadic readers only.
    pub fn request(&self, timeout: Duration) -> FabricResult<()> {
        self.request_nonblocking()?;
        self.await_response(timeout)
    }

    /// Fire a read request without waiting. Sporadic readers only.
    pub fn request_nonblocking(&self) -> FabricResult<()> {
        if !self.shared.attrs.schedule.is_sporadic() {
            return Err(not_sporadic());
        }
        self.shared.request.post(1);
        Ok(())
    }

    /// Wait for a previously fired request's cycle. Sporadic readers only.
    pub fn await_response(&self, timeout: Duration) -> FabricResult<()> {
        if !self.shared.attrs.schedule.is_sporadic() {
            return Err(not_sporadic());
        }
        if self.shared.response.wait_timeout(timeout) {
            Ok(())
        } else {
            Err(FabricError::Cancelled {
                reason: "timed out waiting for a sporadic read response".to_string(),
            })
        }
    }

    /// The registry slot index of the attached producer.
    pub(crate) fn slot(&self) -> usize {
        self.shared.slot
    }

    /// Install the clean hook after a successful build sequence.
    pub(crate) fn set_clean(&mut self, clean: Option<CleanFn>) {
        self.clean = clean;
    }

    /// Full teardown: signal-then-wait the task, drop the attachment,
    /// free the producer slot if this was the last reader of an inactive
    /// producer, invoke the clean hook.
    pub(crate) fn shutdown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let shared = &self.shared;
        shared.control.request_stop();
        // Wake a sporadic task blocked on its own request semaphore.
        shared.request.post(1);
        if wait_for_termination(&shared.control, shared.registry.tuning().stop_wait()).is_err() {
            error!("reader {} task did not stop in time", self.name());
        }
        if let Some(handle) = self.task.take() {
            let _ = handle.join();
        }

        let mut release_family = false;
        match shared.registry.global_write() {
            Ok(guard) => {
                let record = guard.producer_mut(shared.slot);
                let before = record.readers_attached.fetch_sub(1, Ordering::AcqRel);
                if before == 1
                    && record.in_use != 0
                    && record.active.load(Ordering::Acquire) == 0
                {
                    // Last reader of an inactive producer: nobody can
                    // revive it anymore, so erase the identity.
                    record.clear();
                    release_family = true;
                }
            }
            Err(e) => warn!("reader {} detach: {e}", self.name()),
        }
        if release_family {
            shared.buffers.unlink_all();
            debug!("reader {} detached, producer slot freed", self.name());
        }

        if let Some(clean) = self.clean.take() {
            clean();
        }
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn not_sporadic() -> FabricError {
    FabricError::InvalidArgument {
        reason: "request/response requires a sporadic reader".to_string(),
    }
}

/// What one cycle of buffer selection decided.
enum Selection {
    /// Deliver this buffer; its read lock is held.
    Deliver { index: usize, stamp: u64 },
    /// Nothing to deliver this cycle.
    Skip,
    /// The task must exit.
    Stop,
}

/// The acquisition task body.
fn reader_task(shared: Arc<ReaderShared>, mut read_fn: ReadFn) {
    let tuning = *shared.registry.tuning();
    let control = &shared.control;
    let buffers = &shared.buffers;
    let header = buffers.header();
    let schedule = shared.attrs.schedule;
    let writer = WriterSchedule::from_period_us(shared.writer_period_us);

    if !matches!(schedule, ReaderSchedule::Soft) {
        try_elevate_rt(READER_RT_PRIORITY);
    }
    control.running.store(true, Ordering::Release);

    let mut pacer = match schedule {
        ReaderSchedule::Periodic(p) => Some(PeriodPacer::new(p)),
        _ => None,
    };

    // Last delivered (buffer, stamp) pair and the smoothed read latency
    // feeding the swap-skip prediction gate.
    let mut last_seen: (u32, u64) = (u32::MAX, 0);
    let mut est_read_ns: u64 = 0;

    while !control.stopping() {
        if control.pause_requested() {
            control.paused.store(true, Ordering::Release);
            std::thread::sleep(tuning.pause_poll());
            continue;
        }
        if control.is_paused() {
            control.paused.store(false, Ordering::Release);
            if let ReaderSchedule::Periodic(p) = schedule {
                pacer = Some(PeriodPacer::new(p));
            }
        }

        // Sporadic readers run only on request.
        let mut serving = false;
        if schedule.is_sporadic() {
            if !shared.request.wait_timeout(tuning.wait_slice()) {
                continue;
            }
            if control.stopping() {
                break;
            }
            serving = true;
        }

        // A sporadic writer is pulled: post its request, await its
        // response. Going inactive mid-wait skips the cycle.
        let mut pulled = true;
        if writer.is_sporadic() {
            pulled = pull_sporadic_writer(&shared, control, &tuning);
            if control.stopping() {
                if serving {
                    respond(&shared);
                }
                break;
            }
        }

        let selection = if !pulled || !producer_active(&shared) {
            Selection::Skip
        } else {
            select_buffer(
                &shared,
                header,
                &writer,
                schedule,
                last_seen,
                est_read_ns,
                control,
                &tuning,
            )
        };

        match selection {
            Selection::Deliver { index, stamp } => {
                let started = Instant::now();
                let cycle = ReadCycle {
                    buffer_index: index,
                    write_stamp_ns: stamp,
                };
                // SAFETY: the read lock on `index` is held.
                let good = read_fn(unsafe { buffers.buffer(index) }, &cycle);
                let elapsed = started.elapsed();
                buffers.lock(index).unlock_read();

                if !good {
                    debug!("reader {} callback reported failure", shared.attrs.prefix());
                }
                last_seen = (index as u32, stamp);
                est_read_ns = tuning.smooth(est_read_ns, elapsed.as_nanos() as u64);

                if let Some(mut stats) = shared.stats.try_lock() {
                    stats.record(elapsed);
                }
            }
            Selection::Skip => {}
            Selection::Stop => break,
        }

        // Requesters that piled up during this cycle coalesce into it.
        if serving {
            respond(&shared);
        }

        match schedule {
            ReaderSchedule::Periodic(_) => {
                if let Some(pacer) = pacer.as_mut() {
                    pacer.wait();
                }
            }
            // Bounded sleep: prevents busy-waiting and starvation races
            // between competing soft readers of unequal priority.
            ReaderSchedule::Sporadic | ReaderSchedule::Soft => {
                std::thread::sleep(tuning.soft_sleep());
            }
        }
    }

    control.paused.store(false, Ordering::Release);
    control.running.store(false, Ordering::Release);
}

fn producer_active(shared: &ReaderShared) -> bool {
    shared
        .registry
        .producer_atomic(shared.slot)
        .active
        .load(Ordering::Acquire)
        != 0
}

/// Release every requester currently blocked on this reader.
fn respond(shared: &ReaderShared) {
    let extra = shared.request.take_all();
    shared.response.post(1 + extra);
}

/// Post the writer's request semaphore and await its response.
///
/// Returns whether a response arrived; a writer that stopped or went
/// inactive mid-wait yields `false` (skip this cycle).
fn pull_sporadic_writer(
    shared: &ReaderShared,
    control: &TaskControl,
    tuning: &tacta::TuningConfig,
) -> bool {
    let (Some(wreq), Some(wres)) = (shared.buffers.request_sem(), shared.buffers.response_sem())
    else {
        return false;
    };
    wreq.post(1);
    loop {
        if wres.wait_timeout(tuning.wait_slice()) {
            return true;
        }
        if control.stopping() || !producer_active(shared) {
            return false;
        }
    }
}

/// Pick the buffer to read, per the unified selection algorithm.
#[allow(clippy::too_many_arguments)]
fn select_buffer(
    shared: &ReaderShared,
    header: &DataHeader,
    writer: &WriterSchedule,
    schedule: ReaderSchedule,
    last_seen: (u32, u64),
    est_read_ns: u64,
    control: &TaskControl,
    tuning: &tacta::TuningConfig,
) -> Selection {
    let buffers = &shared.buffers;
    let multi = buffers.buffer_count() > 1;

    if multi && !writer.is_sporadic() {
        // Periodic multi-buffer: prefer the last-written buffer when its
        // data is new and the prediction gate does not suppress it.
        let lw = header.last_written.load(Ordering::Acquire) as usize % buffers.buffer_count();
        let stamp = header.stamp(lw);
        let is_new = stamp != 0
            && (lw as u32 != last_seen.0 || stamp != last_seen.1)
            && stamp >= last_seen.1;
        if is_new && !swap_predicted_too_soon(header, est_read_ns) && buffers.lock(lw).try_read() {
            return Selection::Deliver { index: lw, stamp };
        }

        // Fall back to the buffer currently being written: the blocking
        // read lock is granted when the writer swaps away from it. The
        // wait is bounded so a paused writer degrades to redelivering
        // the last good buffer instead of stalling the task.
        let bound = match schedule {
            ReaderSchedule::Periodic(p) => p,
            _ => tuning.wait_slice(),
        };
        let widx = header.writing.load(Ordering::Acquire) as usize % buffers.buffer_count();
        let deadline = Instant::now() + bound;
        loop {
            if buffers.lock(widx).read_timeout(tuning.wait_slice().min(bound)) {
                let stamp = header.stamp(widx);
                if stamp != 0 && stamp >= last_seen.1 {
                    return Selection::Deliver { index: widx, stamp };
                }
                buffers.lock(widx).unlock_read();
                return Selection::Skip;
            }
            if control.stopping() {
                return Selection::Stop;
            }
            if !producer_active(shared) {
                return Selection::Skip;
            }
            if Instant::now() >= deadline {
                // Stale redelivery of the last good buffer.
                if stamp != 0 && stamp >= last_seen.1 && buffers.lock(lw).try_read() {
                    return Selection::Deliver { index: lw, stamp };
                }
                return Selection::Skip;
            }
        }
    }

    // Sporadic writer, soft/sporadic reader, or single buffer: read the
    // currently indicated buffer; retry when a concurrent swap is caught
    // holding the lock.
    loop {
        let index = header.last_written.load(Ordering::Acquire) as usize % buffers.buffer_count();
        let stamp = header.stamp(index);
        if stamp == 0 {
            // Never written yet.
            return Selection::Skip;
        }
        // Periodic single-buffer readers skip when nothing is new.
        if matches!(schedule, ReaderSchedule::Periodic(_))
            && !multi
            && (index as u32, stamp) == last_seen
        {
            return Selection::Skip;
        }
        if stamp < last_seen.1 {
            // Monotonic visibility: never step back to older data.
            return Selection::Skip;
        }
        if buffers.lock(index).try_read() {
            // The stamp may have advanced between the load and the lock;
            // re-read it under the lock.
            let stamp = header.stamp(index);
            return Selection::Deliver { index, stamp };
        }
        if control.stopping() {
            return Selection::Stop;
        }
        if !producer_active(shared) {
            return Selection::Skip;
        }
        std::thread::yield_now();
    }
}

/// Whether consuming the new buffer would likely overrun the writer's
/// predicted next swap: trading one cycle of staleness for avoiding a
/// torn read.
fn swap_predicted_too_soon(header: &DataHeader, est_read_ns: u64) -> bool {
    let next_swap = header.next_swap_ns.load(Ordering::Acquire);
    if next_swap == 0 {
        return false;
    }
    let now = now_monotonic_ns();
    now.saturating_add(est_read_ns) > next_swap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attrs_validation() {
        let mut attrs = ReaderAttrs {
            name: String::new(),
            schedule: ReaderSchedule::Soft,
        };
        assert!(attrs.validate().is_err());
        attrs.name = "palm".to_string();
        assert!(attrs.validate().is_ok());
        attrs.schedule = ReaderSchedule::Periodic(Duration::ZERO);
        assert!(attrs.validate().is_err());
    }

    #[test]
    fn sporadic_detection() {
        assert!(ReaderSchedule::Sporadic.is_sporadic());
        assert!(!ReaderSchedule::Soft.is_sporadic());
        assert!(!ReaderSchedule::Periodic(Duration::from_millis(1)).is_sporadic());
    }
}

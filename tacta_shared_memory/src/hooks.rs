//! Per-role callback capabilities.
//!
//! Every dispatch point is a closure slot with an explicit role type;
//! slots that the original design allowed to be unset are `Option`s.
//! Callbacks receive borrowed views of engine state, never raw pointers,
//! and their boolean results feed the engine's liveness accounting.

use crate::buffers::BufferSet;

/// Context handed to a write callback for one cycle.
pub struct WriteCycle<'a> {
    /// Index of the buffer being filled.
    pub buffer_index: usize,
    /// Total number of buffers.
    pub buffer_count: usize,
    /// Index of the last completely written buffer, if any write has
    /// completed yet.
    pub last_written: Option<usize>,
    pub(crate) set: &'a BufferSet,
}

impl WriteCycle<'_> {
    /// Seed `dst` (the buffer being filled) with the contents of the last
    /// completely written buffer.
    ///
    /// Used by producers that only update part of their data each cycle.
    /// Returns `false` without copying when there is no previous buffer to
    /// copy from (single-buffer producers, or before the first write).
    pub fn copy_last_buffer(&self, dst: &mut [u8]) -> bool {
        let Some(last) = self.last_written else {
            return false;
        };
        if self.buffer_count < 2 || last == self.buffer_index {
            return false;
        }
        // The last-written buffer is stable until the writer swaps into
        // it, which cannot happen while this cycle is still filling the
        // current one.
        let src = unsafe { self.set.buffer(last) };
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        true
    }
}

/// Context handed to a read callback for one cycle.
pub struct ReadCycle {
    /// Index of the buffer being read.
    pub buffer_index: usize,
    /// Completion stamp of the data being read [monotonic ns].
    pub write_stamp_ns: u64,
}

/// Write callback: fill the locked buffer, return `true` on success.
///
/// A `false` return sets the producer's `bad` flag for this cycle; it
/// does not stop the task.
pub type WriteFn = Box<dyn FnMut(&mut [u8], &WriteCycle<'_>) -> bool + Send>;

/// Read callback: consume the locked buffer, return `true` on success.
pub type ReadFn = Box<dyn FnMut(&[u8], &ReadCycle) -> bool + Send>;

/// Init hook, invoked once after the task is running.
pub type InitFn = Box<dyn FnOnce() + Send>;

/// Clean hook, invoked exactly once on teardown - including teardown of a
/// registration that failed partway, so caller-owned state never leaks.
pub type CleanFn = Box<dyn FnOnce() + Send>;

/// Optional init/clean hook pair carried by every object.
#[derive(Default)]
pub struct LifecycleHooks {
    /// Invoked after the task is running.
    pub init: Option<InitFn>,
    /// Invoked on teardown (successful or unwound).
    pub clean: Option<CleanFn>,
}

impl LifecycleHooks {
    /// No hooks.
    pub fn none() -> Self {
        Self::default()
    }
}

/// Per-entity teardown hooks of a user, invoked in the documented order:
/// generic clean, then patches, then modules, then sensors, then the
/// object-specific hook.
#[derive(Default)]
pub struct UserHooks {
    /// Generic clean hook.
    pub clean: Option<CleanFn>,
    /// Invoked once per patch index.
    pub patch_clean: Option<Box<dyn FnMut(usize) + Send>>,
    /// Invoked once per module index.
    pub module_clean: Option<Box<dyn FnMut(usize) + Send>>,
    /// Invoked once per sensor index.
    pub sensor_clean: Option<Box<dyn FnMut(usize) + Send>>,
    /// Object-specific hook, invoked last.
    pub object_clean: Option<CleanFn>,
}

impl UserHooks {
    /// No hooks.
    pub fn none() -> Self {
        Self::default()
    }
}

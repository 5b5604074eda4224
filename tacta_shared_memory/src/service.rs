//! Service registry: writer/reader creation, attachment and teardown
//! against the kernel registry.
//!
//! Construction is a build sequence of fallible steps; each acquired
//! resource releases itself on early return (segment ownership, slot
//! rollback), composed so any failure past slot acquisition unwinds
//! everything created so far - and the caller's clean hook still runs,
//! so caller-owned state never leaks.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tacta::layout::NO_INDEX;
use tacta::sync::SharedSemaphore;
use tracing::{debug, info};

use crate::buffers::BufferSet;
use crate::error::{FabricError, FabricResult};
use crate::hooks::{LifecycleHooks, ReadFn, WriteFn};
use crate::reader::{Reader, ReaderAttrs, ReaderShared};
use crate::registry::Registry;
use crate::stats::TaskStatistics;
use crate::task::TaskControl;
use crate::writer::{Provenance, Writer, WriterAttrs, WriterShared};

/// Create a writer: claim or revive a registry slot, create or attach the
/// buffer family, spawn the task.
///
/// On any failure the clean hook is still invoked before the error is
/// returned.
pub(crate) fn create_writer(
    registry: &Arc<Registry>,
    attrs: WriterAttrs,
    write_fn: WriteFn,
    mut hooks: LifecycleHooks,
) -> FabricResult<Writer> {
    let clean = hooks.clean.take();
    match create_writer_inner(registry, attrs, write_fn, hooks.init) {
        Ok(mut writer) => {
            writer.set_clean(clean);
            Ok(writer)
        }
        Err(e) => {
            if let Some(clean) = clean {
                clean();
            }
            Err(e)
        }
    }
}

fn create_writer_inner(
    registry: &Arc<Registry>,
    attrs: WriterAttrs,
    write_fn: WriteFn,
    init: Option<crate::hooks::InitFn>,
) -> FabricResult<Writer> {
    attrs.validate()?;
    let prefix = attrs.prefix().to_string();
    let buffer_size = attrs.buffer_size as u64;
    let buffer_count = attrs.buffer_count as u32;
    let period_us = attrs.schedule.period_us();
    let sporadic = attrs.schedule.is_sporadic();

    // Slot search and claim, under the global write lock.
    let (slot, provenance) = {
        let guard = registry.global_write()?;
        match guard.find_producer(&prefix) {
            Some(index) => {
                let record = guard.producer_mut(index);
                if record.active.load(Ordering::Acquire) != 0 {
                    // A live producer already publishes under this name.
                    // Compatible attributes yield an alias handle onto it
                    // (the already-active outcome); incompatible ones are
                    // a fatal collision.
                    if !record.attrs_match(buffer_size, buffer_count, period_us) {
                        return Err(FabricError::AlreadyExists { name: prefix });
                    }
                    drop(guard);
                    let buffers = BufferSet::attach(
                        &prefix,
                        attrs.buffer_size,
                        attrs.buffer_count,
                        sporadic,
                    )?;
                    let shared = Arc::new(WriterShared {
                        attrs,
                        control: TaskControl::new(),
                        buffers,
                        registry: Arc::clone(registry),
                        slot: index,
                        stats: Mutex::new(TaskStatistics::new()),
                    });
                    info!("writer {prefix} already active, aliasing slot {index}");
                    return Ok(Writer::attach_alias(
                        shared,
                        LifecycleHooks { init, clean: None },
                    ));
                }
                if record.readers_attached.load(Ordering::Acquire) > 0 {
                    // Revival candidate: the identity survives only if
                    // every attribute matches.
                    if !record.attrs_match(buffer_size, buffer_count, period_us) {
                        return Err(FabricError::AlreadyExists { name: prefix });
                    }
                    record.writer_pid = std::process::id();
                    record.active.store(1, Ordering::Release);
                    (index, Provenance::Revived)
                } else {
                    // Inactive with no readers: a leftover identity with
                    // nobody depending on it. Reclaim as fresh.
                    record.clear();
                    claim_fresh(record, &prefix, buffer_size, buffer_count, period_us);
                    (index, Provenance::Fresh)
                }
            }
            None => {
                let index = guard.find_free_producer().ok_or(FabricError::OutOfSpace {
                    what: "producer table",
                })?;
                claim_fresh(
                    guard.producer_mut(index),
                    &prefix,
                    buffer_size,
                    buffer_count,
                    period_us,
                );
                (index, Provenance::Fresh)
            }
        }
    };

    // Resource creation happens outside the lock; the slot rolls back on
    // any failure from here on.
    let rollback_slot = |registry: &Arc<Registry>| {
        if let Ok(guard) = registry.global_write() {
            let record = guard.producer_mut(slot);
            match provenance {
                Provenance::Fresh => record.clear(),
                Provenance::Revived => record.active.store(0, Ordering::Release),
            }
        }
    };

    let buffers = match provenance {
        Provenance::Fresh => {
            BufferSet::create_owned(&prefix, attrs.buffer_size, attrs.buffer_count, sporadic)
        }
        Provenance::Revived => {
            BufferSet::attach(&prefix, attrs.buffer_size, attrs.buffer_count, sporadic)
        }
    }
    .inspect_err(|_| rollback_slot(registry))?;

    let shared = Arc::new(WriterShared {
        attrs,
        control: TaskControl::new(),
        buffers,
        registry: Arc::clone(registry),
        slot,
        stats: Mutex::new(TaskStatistics::new()),
    });

    let hooks = LifecycleHooks { init, clean: None };
    let writer = Writer::spawn(shared, write_fn, hooks, provenance).inspect_err(|_| {
        // Dropping the buffer set unlinked fresh files already; only the
        // slot needs explicit rollback.
        rollback_slot(registry);
    })?;

    match provenance {
        Provenance::Fresh => info!("writer {prefix} created in slot {slot}"),
        Provenance::Revived => info!("writer {prefix} revived in slot {slot}"),
    }
    Ok(writer)
}

fn claim_fresh(
    record: &mut tacta::ProducerRecord,
    prefix: &str,
    buffer_size: u64,
    buffer_count: u32,
    period_us: u64,
) {
    record.set_name(prefix);
    record.buffer_size = buffer_size;
    record.buffer_count = buffer_count;
    record.period_us = period_us;
    record.readers_attached.store(0, Ordering::Release);
    record.driver_index = NO_INDEX;
    record.writer_pid = std::process::id();
    record.in_use = 1;
    record.bad.store(0, Ordering::Release);
    record.active.store(1, Ordering::Release);
}

/// Attach a reader to a named producer and spawn its task.
///
/// On any failure the clean hook is still invoked before the error is
/// returned.
pub(crate) fn attach_reader(
    registry: &Arc<Registry>,
    attrs: ReaderAttrs,
    read_fn: ReadFn,
    mut hooks: LifecycleHooks,
) -> FabricResult<Reader> {
    let clean = hooks.clean.take();
    match attach_reader_inner(registry, attrs, read_fn, hooks.init) {
        Ok(mut reader) => {
            reader.set_clean(clean);
            Ok(reader)
        }
        Err(e) => {
            if let Some(clean) = clean {
                clean();
            }
            Err(e)
        }
    }
}

fn attach_reader_inner(
    registry: &Arc<Registry>,
    attrs: ReaderAttrs,
    read_fn: ReadFn,
    init: Option<crate::hooks::InitFn>,
) -> FabricResult<Reader> {
    attrs.validate()?;
    let prefix = attrs.prefix().to_string();

    // Locate the producer and register our attachment under the lock.
    let (slot, buffer_size, buffer_count, period_us) = {
        let guard = registry.global_write()?;
        let index = guard
            .find_producer(&prefix)
            .ok_or_else(|| FabricError::NotFound {
                name: prefix.clone(),
            })?;
        let record = guard.producer_mut(index);
        if record.active.load(Ordering::Acquire) == 0 {
            // Inactive producers are invisible to attaching readers.
            return Err(FabricError::NotFound {
                name: prefix.clone(),
            });
        }
        record.readers_attached.fetch_add(1, Ordering::AcqRel);
        (
            index,
            record.buffer_size as usize,
            record.buffer_count as usize,
            record.period_us,
        )
    };

    let rollback_attach = |registry: &Arc<Registry>| {
        if let Ok(guard) = registry.global_write() {
            guard
                .producer(slot)
                .readers_attached
                .fetch_sub(1, Ordering::AcqRel);
        }
    };

    let buffers = BufferSet::attach(&prefix, buffer_size, buffer_count, period_us == 0)
        .inspect_err(|_| rollback_attach(registry))?;

    let shared = Arc::new(ReaderShared {
        attrs,
        control: TaskControl::new(),
        buffers,
        registry: Arc::clone(registry),
        slot,
        writer_period_us: period_us,
        stats: Mutex::new(TaskStatistics::new()),
        request: SharedSemaphore::new(),
        response: SharedSemaphore::new(),
    });

    let hooks = LifecycleHooks { init, clean: None };
    let reader = Reader::spawn(shared, read_fn, hooks)
        .inspect_err(|_| rollback_attach(registry))?;

    debug!("reader attached to {prefix} (slot {slot})");
    Ok(reader)
}

// ─── Generational bookkeeping arena ────────────────────────────────

/// Typed handle into a [`Slots`] arena. A handle outliving its object is
/// detected by the generation check and reported as an error, never
/// undefined behavior.
pub struct SlotId<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SlotId<T> {
    /// The raw slot index (diagnostic).
    pub fn index(&self) -> u32 {
        self.index
    }

    /// A handle that resolves to nothing, ever. Useful as a sentinel.
    pub fn dangling() -> Self {
        Self {
            index: u32::MAX,
            generation: u32::MAX,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SlotId<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SlotId<T> {}

impl<T> PartialEq for SlotId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}
impl<T> Eq for SlotId<T> {}

impl<T> std::fmt::Debug for SlotId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotId({}v{})", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Growable generational arena tracking this process's live objects, so
/// the owning session can enumerate them and auto-clean on teardown.
pub struct Slots<T> {
    entries: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> Slots<T> {
    /// An empty arena.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a value, reusing a free slot when available.
    pub fn insert(&mut self, value: T) -> SlotId<T> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.entries[index as usize];
            slot.value = Some(value);
            SlotId {
                index,
                generation: slot.generation,
                _marker: PhantomData,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Slot {
                generation: 0,
                value: Some(value),
            });
            SlotId {
                index,
                generation: 0,
                _marker: PhantomData,
            }
        }
    }

    /// Look up a live value; a stale or foreign handle yields `None`.
    pub fn get(&self, id: SlotId<T>) -> Option<&T> {
        self.entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// Mutable lookup with the same staleness check.
    pub fn get_mut(&mut self, id: SlotId<T>) -> Option<&mut T> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    /// Remove and return a live value, invalidating every copy of its
    /// handle.
    pub fn remove(&mut self, id: SlotId<T>) -> Option<T> {
        let slot = self
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(value)
    }

    /// Iterate over live values.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|slot| slot.value.as_ref())
    }

    /// Iterate over live values mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries
            .iter_mut()
            .filter_map(|slot| slot.value.as_mut())
    }

    /// Iterate over live values together with their handles.
    pub fn iter_with_ids(&self) -> impl Iterator<Item = (SlotId<T>, &T)> {
        self.entries.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    SlotId {
                        index: index as u32,
                        generation: slot.generation,
                        _marker: PhantomData,
                    },
                    value,
                )
            })
        })
    }

    /// Drain every live value out of the arena.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (index, slot) in self.entries.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
                out.push(value);
            }
        }
        out
    }

    /// Number of live values.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.value.is_some()).count()
    }

    /// Whether no values are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Slots<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a stale-handle lookup failure to the error taxonomy.
pub(crate) fn stale_handle(kind: &str) -> FabricError {
    FabricError::InvalidArgument {
        reason: format!("stale or foreign {kind} handle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut slots: Slots<String> = Slots::new();
        let a = slots.insert("a".to_string());
        let b = slots.insert("b".to_string());

        assert_eq!(slots.get(a).map(String::as_str), Some("a"));
        assert_eq!(slots.get(b).map(String::as_str), Some("b"));
        assert_eq!(slots.len(), 2);

        assert_eq!(slots.remove(a), Some("a".to_string()));
        assert!(slots.get(a).is_none(), "removed handle must go stale");
        assert_eq!(slots.remove(a), None);
    }

    #[test]
    fn reused_slot_invalidates_old_handle() {
        let mut slots: Slots<u32> = Slots::new();
        let old = slots.insert(1);
        slots.remove(old);

        let new = slots.insert(2);
        assert_eq!(new.index(), old.index(), "slot must be reused");
        assert!(slots.get(old).is_none(), "old generation must not resolve");
        assert_eq!(slots.get(new), Some(&2));
    }

    #[test]
    fn drain_empties_and_invalidates() {
        let mut slots: Slots<u32> = Slots::new();
        let a = slots.insert(1);
        slots.insert(2);

        let drained = slots.drain();
        assert_eq!(drained.len(), 2);
        assert!(slots.is_empty());
        assert!(slots.get(a).is_none());
    }
}

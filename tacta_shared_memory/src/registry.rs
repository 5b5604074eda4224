//! Kernel registry: the one shared block every fabric process attaches.
//!
//! Whichever process creates the block initializes every field and both
//! locks, then publishes `initialized`; all other attachers block
//! (bounded, futex) until exactly one of `initialized` /
//! `initialization_failed` is set, then validate the six layout-size
//! fields. Any disagreement fails the connection with a layout-mismatch
//! error - a build inconsistency, never silently ignored.
//!
//! Lock ordering: when both locks are needed, the global lock is taken
//! before the drivers lock, everywhere. Hot-path buffer traffic never
//! takes either lock.

use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use tacta::consts::{MAX_DRIVERS, MAX_PRODUCERS, REGISTRY_MAGIC};
use tacta::layout::registry::{drivers_offset, producers_offset, registry_block_size};
use tacta::layout::{DriverRecord, ProducerRecord, RegistryHeader, RegistryLayout};
use tacta::naming::registry_name;
use tacta::sync::futex::{futex_wait, futex_wake_all};
use tacta::TuningConfig;
use tracing::{debug, info};

use crate::arena::Segment;
use crate::error::{FabricError, FabricResult};

/// Process-local attachment to the kernel registry.
pub struct Registry {
    segment: Segment,
    tuning: TuningConfig,
}

impl Registry {
    /// Create the registry block, or attach to the existing one.
    ///
    /// The first creator initializes all fields and both locks; all
    /// others wait for initialization and validate the layout fields.
    pub fn create_or_attach(name: &str, tuning: TuningConfig) -> FabricResult<Self> {
        let block_name = registry_name(name);
        // A creator that lost the creation race may not have sized the
        // file yet; a short block here is transient, not a mismatch.
        let deadline = Instant::now() + tuning.init_wait();
        let (segment, created) = loop {
            match Segment::create_or_attach(&block_name, registry_block_size()) {
                Ok(pair) => break pair,
                Err(FabricError::LayoutMismatch { .. }) if Instant::now() < deadline => {
                    std::thread::sleep(tuning.wait_slice());
                }
                Err(e) => return Err(e),
            }
        };
        // The registry outlives every process; nobody unlinks it on drop.
        segment.disown();

        let registry = Self { segment, tuning };
        if created {
            registry.initialize();
            info!("kernel registry {block_name} created");
        } else {
            registry.await_initialization()?;
            registry.validate_layout()?;
            debug!("kernel registry {block_name} attached");
        }
        Ok(registry)
    }

    fn initialize(&self) {
        // SAFETY: we created the block; no other process can see it as
        // initialized until the flag below is published.
        let header = unsafe { self.segment.at_mut::<RegistryHeader>(0) };
        header.magic = REGISTRY_MAGIC;
        header.layout = RegistryLayout::current();
        header.global_lock.init();
        header.drivers_lock.init();
        header.init_failed.store(0, Ordering::Release);
        // Record tables are zero-filled by the kernel: every slot reads
        // as free (`in_use == 0`).
        fence(Ordering::Release);
        header.initialized.store(1, Ordering::Release);
        futex_wake_all(&header.initialized);
    }

    fn await_initialization(&self) -> FabricResult<()> {
        let header = self.header();
        let deadline = Instant::now() + self.tuning.init_wait();
        loop {
            if header.initialized.load(Ordering::Acquire) != 0 {
                return Ok(());
            }
            if header.init_failed.load(Ordering::Acquire) != 0 {
                return Err(FabricError::Cancelled {
                    reason: "registry initialization failed in the creating process".to_string(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FabricError::Cancelled {
                    reason: "timed out waiting for registry initialization".to_string(),
                });
            }
            futex_wait(
                &header.initialized,
                0,
                Some((deadline - now).min(self.tuning.wait_slice())),
            );
        }
    }

    fn validate_layout(&self) -> FabricResult<()> {
        let header = self.header();
        if !header.is_magic_valid() || header.layout != RegistryLayout::current() {
            return Err(FabricError::LayoutMismatch {
                name: self.segment.name().to_string(),
            });
        }
        Ok(())
    }

    /// The registry header.
    pub fn header(&self) -> &RegistryHeader {
        // SAFETY: offset 0 always holds the header; shared fields are
        // atomics or lock-protected.
        unsafe { self.segment.at::<RegistryHeader>(0) }
    }

    /// The active tuning configuration.
    pub fn tuning(&self) -> &TuningConfig {
        &self.tuning
    }

    fn producer_ptr(&self, index: usize) -> *mut ProducerRecord {
        debug_assert!(index < MAX_PRODUCERS);
        // SAFETY: index bounded by the table capacity.
        unsafe {
            self.segment
                .base()
                .add(producers_offset())
                .cast::<ProducerRecord>()
                .add(index)
        }
    }

    fn driver_ptr(&self, index: usize) -> *mut DriverRecord {
        debug_assert!(index < MAX_DRIVERS);
        // SAFETY: index bounded by the table capacity.
        unsafe {
            self.segment
                .base()
                .add(drivers_offset())
                .cast::<DriverRecord>()
                .add(index)
        }
    }

    /// Producer record for lock-free hot-path reads of its atomic fields
    /// (`active`, `bad`, `readers_attached`). Non-atomic fields read this
    /// way may be torn and must not be trusted.
    pub fn producer_atomic(&self, index: usize) -> &ProducerRecord {
        // SAFETY: the reference is only used for its atomic fields.
        unsafe { &*self.producer_ptr(index) }
    }

    /// Driver record for lock-free hot-path reads of its atomic fields.
    pub fn driver_atomic(&self, index: usize) -> &DriverRecord {
        // SAFETY: the reference is only used for its atomic fields.
        unsafe { &*self.driver_ptr(index) }
    }

    /// Take the global lock for shared reading.
    pub fn global_read(&self) -> FabricResult<GlobalReadGuard<'_>> {
        if self
            .header()
            .global_lock
            .read_timeout(self.tuning.lock_wait())
        {
            Ok(GlobalReadGuard { registry: self })
        } else {
            Err(lock_timeout("global"))
        }
    }

    /// Take the global lock exclusively.
    pub fn global_write(&self) -> FabricResult<GlobalWriteGuard<'_>> {
        if self
            .header()
            .global_lock
            .write_timeout(self.tuning.lock_wait())
        {
            Ok(GlobalWriteGuard { registry: self })
        } else {
            Err(lock_timeout("global"))
        }
    }

    /// Take the drivers lock for shared reading.
    pub fn drivers_read(&self) -> FabricResult<DriversReadGuard<'_>> {
        if self
            .header()
            .drivers_lock
            .read_timeout(self.tuning.lock_wait())
        {
            Ok(DriversReadGuard { registry: self })
        } else {
            Err(lock_timeout("drivers"))
        }
    }

    /// Take the drivers lock exclusively.
    pub fn drivers_write(&self) -> FabricResult<DriversWriteGuard<'_>> {
        if self
            .header()
            .drivers_lock
            .write_timeout(self.tuning.lock_wait())
        {
            Ok(DriversWriteGuard { registry: self })
        } else {
            Err(lock_timeout("drivers"))
        }
    }
}

fn lock_timeout(which: &str) -> FabricError {
    FabricError::Cancelled {
        reason: format!("timed out acquiring the {which} registry lock"),
    }
}

/// Shared view of the producer table.
pub struct GlobalReadGuard<'a> {
    registry: &'a Registry,
}

impl GlobalReadGuard<'_> {
    /// The full producer table; callers filter on `in_use`.
    pub fn producers(&self) -> &[ProducerRecord] {
        // SAFETY: shared lock held; mutations require the write lock.
        unsafe { std::slice::from_raw_parts(self.registry.producer_ptr(0), MAX_PRODUCERS) }
    }

    /// One producer record.
    pub fn producer(&self, index: usize) -> &ProducerRecord {
        &self.producers()[index]
    }

    /// Index of the in-use slot holding `prefix`, if any.
    pub fn find_producer(&self, prefix: &str) -> Option<usize> {
        self.producers().iter().position(|r| r.name_matches(prefix))
    }
}

impl Drop for GlobalReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.header().global_lock.unlock_read();
    }
}

/// Exclusive view of the producer table.
pub struct GlobalWriteGuard<'a> {
    registry: &'a Registry,
}

impl GlobalWriteGuard<'_> {
    /// The full producer table.
    pub fn producers(&self) -> &[ProducerRecord] {
        // SAFETY: exclusive lock held.
        unsafe { std::slice::from_raw_parts(self.registry.producer_ptr(0), MAX_PRODUCERS) }
    }

    /// One producer record.
    pub fn producer(&self, index: usize) -> &ProducerRecord {
        &self.producers()[index]
    }

    /// One producer record, mutably.
    #[allow(clippy::mut_from_ref)]
    pub fn producer_mut(&self, index: usize) -> &mut ProducerRecord {
        // SAFETY: exclusive lock held; no other reference is live because
        // every access path goes through a guard.
        unsafe { &mut *self.registry.producer_ptr(index) }
    }

    /// Index of the in-use slot holding `prefix`, if any.
    pub fn find_producer(&self, prefix: &str) -> Option<usize> {
        self.producers().iter().position(|r| r.name_matches(prefix))
    }

    /// Index of the first free slot, if any.
    pub fn find_free_producer(&self) -> Option<usize> {
        self.producers().iter().position(|r| r.in_use == 0)
    }
}

impl Drop for GlobalWriteGuard<'_> {
    fn drop(&mut self) {
        self.registry.header().global_lock.unlock_write();
    }
}

/// Shared view of the driver table.
pub struct DriversReadGuard<'a> {
    registry: &'a Registry,
}

impl DriversReadGuard<'_> {
    /// The full driver table; callers filter on `in_use`.
    pub fn drivers(&self) -> &[DriverRecord] {
        // SAFETY: shared lock held.
        unsafe { std::slice::from_raw_parts(self.registry.driver_ptr(0), MAX_DRIVERS) }
    }

    /// One driver record.
    pub fn driver(&self, index: usize) -> &DriverRecord {
        &self.drivers()[index]
    }
}

impl Drop for DriversReadGuard<'_> {
    fn drop(&mut self) {
        self.registry.header().drivers_lock.unlock_read();
    }
}

/// Exclusive view of the driver table.
pub struct DriversWriteGuard<'a> {
    registry: &'a Registry,
}

impl DriversWriteGuard<'_> {
    /// The full driver table.
    pub fn drivers(&self) -> &[DriverRecord] {
        // SAFETY: exclusive lock held.
        unsafe { std::slice::from_raw_parts(self.registry.driver_ptr(0), MAX_DRIVERS) }
    }

    /// One driver record.
    pub fn driver(&self, index: usize) -> &DriverRecord {
        &self.drivers()[index]
    }

    /// One driver record, mutably.
    #[allow(clippy::mut_from_ref)]
    pub fn driver_mut(&self, index: usize) -> &mut DriverRecord {
        // SAFETY: exclusive lock held.
        unsafe { &mut *self.registry.driver_ptr(index) }
    }

    /// Index of the first free slot, if any.
    pub fn find_free_driver(&self) -> Option<usize> {
        self.drivers().iter().position(|r| r.in_use == 0)
    }

    /// Index of the in-use driver backed by producer slot
    /// `writer_index`, if any.
    pub fn find_by_writer(&self, writer_index: usize) -> Option<usize> {
        self.drivers()
            .iter()
            .position(|r| r.in_use != 0 && r.writer_index == writer_index as i32)
    }
}

impl Drop for DriversWriteGuard<'_> {
    fn drop(&mut self) {
        self.registry.header().drivers_lock.unlock_write();
    }
}

//! Kernel registry block layout.
//!
//! One shared block, attached by every process, holding the producer and
//! driver record tables plus the two coarse-grained locks. The header
//! leads with layout-identifying size fields; every attacher validates
//! them against its own build and refuses the connection on any
//! disagreement. A size mismatch signals a build/configuration
//! inconsistency, which is always fatal and always distinct from
//! "not found".

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use static_assertions::const_assert_eq;

use crate::consts::{MAX_DRIVERS, MAX_NAME_LEN, MAX_PRODUCERS, MAX_SENSOR_TYPES, PAGE_SIZE, REGISTRY_MAGIC};
use crate::layout::topology::{ProducerAttr, TopologyHeader};
use crate::sync::SharedRwLock;

/// Sentinel for "no driver" / "no writer" back-references.
pub const NO_INDEX: i32 = -1;

/// Sizes of every record type, recorded at creation and checked by every
/// attacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RegistryLayout {
    /// `size_of::<RegistryHeader>()`.
    pub registry_header: u32,
    /// `size_of::<ProducerRecord>()`.
    pub producer_record: u32,
    /// `size_of::<DriverRecord>()`.
    pub driver_record: u32,
    /// `size_of::<ProducerAttr>()`.
    pub producer_attr: u32,
    /// `size_of::<SharedRwLock>()`.
    pub rwlock: u32,
    /// `size_of::<TopologyHeader>()`.
    pub topology_header: u32,
}

const_assert_eq!(core::mem::size_of::<RegistryLayout>(), 24);

impl RegistryLayout {
    /// The layout of the current build.
    pub fn current() -> Self {
        Self {
            registry_header: core::mem::size_of::<RegistryHeader>() as u32,
            producer_record: core::mem::size_of::<ProducerRecord>() as u32,
            driver_record: core::mem::size_of::<DriverRecord>() as u32,
            producer_attr: core::mem::size_of::<ProducerAttr>() as u32,
            rwlock: core::mem::size_of::<SharedRwLock>() as u32,
            topology_header: core::mem::size_of::<TopologyHeader>() as u32,
        }
    }
}

/// Registry block header (64 bytes, cache-line aligned).
///
/// Exactly one of `initialized` / `init_failed` becomes nonzero exactly
/// once; every attacher blocks (bounded) until one does.
#[repr(C, align(64))]
pub struct RegistryHeader {
    /// Must equal [`REGISTRY_MAGIC`].
    pub magic: [u8; 8],
    /// Layout of the creating build.
    pub layout: RegistryLayout,
    /// Set to 1 by the creator once every field and both locks are ready.
    pub initialized: AtomicU32,
    /// Set to 1 by the creator if initialization failed partway.
    pub init_failed: AtomicU32,
    /// Protects the producer table and general bookkeeping.
    pub global_lock: SharedRwLock,
    /// Protects the driver table and driver-to-writer backlinks. Separate
    /// from the global lock so driver registration does not serialize
    /// unrelated producer traffic.
    pub drivers_lock: SharedRwLock,
    /// Padding to a full cache line.
    pub _pad: [u8; 8],
}

const_assert_eq!(core::mem::size_of::<RegistryHeader>(), 64);
const_assert_eq!(core::mem::align_of::<RegistryHeader>(), 64);

impl RegistryHeader {
    /// Whether the magic bytes identify a registry block.
    pub fn is_magic_valid(&self) -> bool {
        self.magic == REGISTRY_MAGIC
    }
}

/// One producer slot in the registry (72 bytes).
///
/// Non-atomic fields are mutated only under the global write lock. The
/// atomic fields are read on hot paths without any registry lock.
#[repr(C)]
pub struct ProducerRecord {
    /// Truncated name prefix, NUL-padded.
    pub name: [u8; MAX_NAME_LEN],
    /// Size of one buffer in bytes.
    pub buffer_size: u64,
    /// Writer period in microseconds; 0 means sporadic.
    pub period_us: u64,
    /// Number of buffers (1..=MAX_BUFFER_COUNT).
    pub buffer_count: u32,
    /// Count of currently attached readers.
    pub readers_attached: AtomicU32,
    /// Index into the driver table, or [`NO_INDEX`].
    pub driver_index: i32,
    /// Process id of the owning writer (diagnostic; updated on revival).
    pub writer_pid: u32,
    /// Slot is claimed (name and attributes are meaningful).
    pub in_use: u8,
    /// Producer is live; cleared first on teardown so the data becomes
    /// invisible to attaching readers before the task stops.
    pub active: AtomicU8,
    /// Last write callback reported failure.
    pub bad: AtomicU8,
    /// Padding to 72 bytes.
    pub _pad: [u8; 5],
}

const_assert_eq!(core::mem::size_of::<ProducerRecord>(), 72);

impl ProducerRecord {
    /// Store a (pre-truncated) name prefix, NUL-padding the remainder.
    pub fn set_name(&mut self, prefix: &str) {
        let bytes = prefix.as_bytes();
        let n = bytes.len().min(MAX_NAME_LEN);
        self.name[..n].copy_from_slice(&bytes[..n]);
        self.name[n..].fill(0);
    }

    /// The stored name prefix as a string slice (up to the first NUL).
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Whether this slot stores exactly `prefix`.
    pub fn name_matches(&self, prefix: &str) -> bool {
        self.in_use != 0 && self.name_str() == prefix
    }

    /// Whether the stored task attributes equal the given ones.
    pub fn attrs_match(&self, buffer_size: u64, buffer_count: u32, period_us: u64) -> bool {
        self.buffer_size == buffer_size
            && self.buffer_count == buffer_count
            && self.period_us == period_us
    }

    /// Reset the slot to the free state.
    pub fn clear(&mut self) {
        self.name.fill(0);
        self.buffer_size = 0;
        self.period_us = 0;
        self.buffer_count = 0;
        self.readers_attached.store(0, Ordering::Release);
        self.driver_index = NO_INDEX;
        self.writer_pid = 0;
        self.in_use = 0;
        self.active.store(0, Ordering::Release);
        self.bad.store(0, Ordering::Release);
    }
}

/// One driver slot in the registry (96 bytes).
#[repr(C)]
pub struct DriverRecord {
    /// Declared topology dimensions.
    pub attr: ProducerAttr,
    /// Number of distinct sensor types served.
    pub sensor_type_count: u32,
    /// The distinct sensor types, first `sensor_type_count` entries valid.
    pub sensor_types: [u32; MAX_SENSOR_TYPES],
    /// Count of currently attached users.
    pub users_attached: AtomicU32,
    /// Index of the backing producer slot, or [`NO_INDEX`].
    pub writer_index: i32,
    /// Slot is claimed.
    pub in_use: u8,
    /// Driver is live.
    pub active: AtomicU8,
    /// Padding to 96 bytes.
    pub _pad: [u8; 6],
}

const_assert_eq!(core::mem::size_of::<DriverRecord>(), 96);

impl DriverRecord {
    /// The valid prefix of the sensor type table.
    pub fn types(&self) -> &[u32] {
        &self.sensor_types[..self.sensor_type_count as usize]
    }

    /// Whether this driver serves the given sensor type.
    pub fn serves_type(&self, sensor_type: u32) -> bool {
        self.types().contains(&sensor_type)
    }

    /// Reset the slot to the free state.
    pub fn clear(&mut self) {
        self.attr = ProducerAttr::default();
        self.sensor_type_count = 0;
        self.sensor_types.fill(0);
        self.users_attached.store(0, Ordering::Release);
        self.writer_index = NO_INDEX;
        self.in_use = 0;
        self.active.store(0, Ordering::Release);
    }
}

/// Byte offset of the producer table within the registry block.
pub const fn producers_offset() -> usize {
    core::mem::size_of::<RegistryHeader>()
}

/// Byte offset of the driver table within the registry block.
pub const fn drivers_offset() -> usize {
    producers_offset() + MAX_PRODUCERS * core::mem::size_of::<ProducerRecord>()
}

/// Total registry block size, page-rounded.
pub const fn registry_block_size() -> usize {
    let raw = drivers_offset() + MAX_DRIVERS * core::mem::size_of::<DriverRecord>();
    (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_itself() {
        assert_eq!(RegistryLayout::current(), RegistryLayout::current());
    }

    #[test]
    fn record_sizes() {
        assert_eq!(core::mem::size_of::<ProducerRecord>(), 72);
        assert_eq!(core::mem::size_of::<DriverRecord>(), 96);
        assert_eq!(core::mem::size_of::<RegistryHeader>(), 64);
    }

    #[test]
    fn block_size_is_page_rounded() {
        assert_eq!(registry_block_size() % PAGE_SIZE, 0);
        assert!(registry_block_size() >= drivers_offset());
    }

    #[test]
    fn producer_name_roundtrip() {
        let mut record: ProducerRecord = unsafe { core::mem::zeroed() };
        record.in_use = 1;
        record.set_name("fingertip");
        assert_eq!(record.name_str(), "fingertip");
        assert!(record.name_matches("fingertip"));
        assert!(!record.name_matches("palm"));
        record.clear();
        assert!(!record.name_matches("fingertip"));
        assert_eq!(record.driver_index, NO_INDEX);
    }

    #[test]
    fn driver_type_lookup() {
        let mut record: DriverRecord = unsafe { core::mem::zeroed() };
        record.sensor_types[0] = 4;
        record.sensor_types[1] = 9;
        record.sensor_type_count = 2;
        assert!(record.serves_type(4));
        assert!(record.serves_type(9));
        assert!(!record.serves_type(5));
    }
}

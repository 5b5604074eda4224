//! Driver topology block layout (`DS`).
//!
//! A driver publishes its sensor topology as three flat record arrays:
//! patches own a contiguous run of modules, modules own a contiguous run
//! of sensors, and every sensor back-references its module and patch.
//! Users copy these arrays once at attach time into a process-local
//! indexed view; the block itself is never walked on the hot path.

use static_assertions::const_assert_eq;

use crate::consts::{PAGE_SIZE, TOPOLOGY_MAGIC};

/// Declared topology dimensions of a driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ProducerAttr {
    /// Number of patches.
    pub patch_count: u32,
    /// Number of modules across all patches.
    pub module_count: u32,
    /// Number of sensors across all modules.
    pub sensor_count: u32,
}

const_assert_eq!(core::mem::size_of::<ProducerAttr>(), 12);

/// Topology block header (64 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct TopologyHeader {
    /// Must equal [`TOPOLOGY_MAGIC`].
    pub magic: [u8; 8],
    /// `size_of::<TopologyHeader>()` of the creating build.
    pub header_size: u32,
    /// `size_of::<PatchRecord>()` of the creating build.
    pub patch_record: u32,
    /// `size_of::<ModuleRecord>()` of the creating build.
    pub module_record: u32,
    /// `size_of::<SensorRecord>()` of the creating build.
    pub sensor_record: u32,
    /// Declared dimensions; the record arrays follow in this order.
    pub attr: ProducerAttr,
    /// Padding to a full cache line.
    pub _pad: [u8; 28],
}

const_assert_eq!(core::mem::size_of::<TopologyHeader>(), 64);
const_assert_eq!(core::mem::align_of::<TopologyHeader>(), 64);

impl TopologyHeader {
    /// Initialize the header in place. Called once by the creating driver.
    pub fn init(&mut self, attr: ProducerAttr) {
        self.magic = TOPOLOGY_MAGIC;
        self.header_size = core::mem::size_of::<Self>() as u32;
        self.patch_record = core::mem::size_of::<PatchRecord>() as u32;
        self.module_record = core::mem::size_of::<ModuleRecord>() as u32;
        self.sensor_record = core::mem::size_of::<SensorRecord>() as u32;
        self.attr = attr;
    }

    /// Whether the magic bytes identify a topology block.
    pub fn is_magic_valid(&self) -> bool {
        self.magic == TOPOLOGY_MAGIC
    }

    /// Whether every recorded record size equals the current build's.
    pub fn layout_matches(&self) -> bool {
        self.header_size as usize == core::mem::size_of::<Self>()
            && self.patch_record as usize == core::mem::size_of::<PatchRecord>()
            && self.module_record as usize == core::mem::size_of::<ModuleRecord>()
            && self.sensor_record as usize == core::mem::size_of::<SensorRecord>()
    }
}

/// One patch: a contiguous run of modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PatchRecord {
    /// Index of the first module belonging to this patch.
    pub first_module: u32,
    /// Number of modules in this patch.
    pub module_count: u32,
}

const_assert_eq!(core::mem::size_of::<PatchRecord>(), 8);

/// One module: a contiguous run of sensors, back-referencing its patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ModuleRecord {
    /// Index of the first sensor belonging to this module.
    pub first_sensor: u32,
    /// Number of sensors in this module.
    pub sensor_count: u32,
    /// Index of the owning patch.
    pub patch: u32,
}

const_assert_eq!(core::mem::size_of::<ModuleRecord>(), 12);

/// One sensor, back-referencing its module and patch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SensorRecord {
    /// Declared sensor type.
    pub type_id: u32,
    /// Index of the owning module.
    pub module: u32,
    /// Index of the owning patch.
    pub patch: u32,
}

const_assert_eq!(core::mem::size_of::<SensorRecord>(), 12);

/// Byte offset of the patch array within the topology block.
pub const fn patches_offset() -> usize {
    core::mem::size_of::<TopologyHeader>()
}

/// Byte offset of the module array.
pub const fn modules_offset(attr: &ProducerAttr) -> usize {
    patches_offset() + attr.patch_count as usize * core::mem::size_of::<PatchRecord>()
}

/// Byte offset of the sensor array.
pub const fn sensors_offset(attr: &ProducerAttr) -> usize {
    modules_offset(attr) + attr.module_count as usize * core::mem::size_of::<ModuleRecord>()
}

/// Total topology block size for the given dimensions, page-rounded.
pub const fn topology_block_size(attr: &ProducerAttr) -> usize {
    let raw = sensors_offset(attr) + attr.sensor_count as usize * core::mem::size_of::<SensorRecord>();
    (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

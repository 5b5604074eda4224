//! TACTA shared memory constants.
//!
//! These constants define the fundamental parameters of the TACTA fabric.
//! They are the single source of truth - all other crates import from here.
//! Changing any capacity constant changes the shared layouts, which the
//! registry's layout fields will detect as a mismatch across builds.

/// Magic bytes identifying the kernel registry block: `"TACTAREG"`.
pub const REGISTRY_MAGIC: [u8; 8] = *b"TACTAREG";

/// Magic bytes identifying a producer data block: `"TACTAMEM"`.
pub const DATA_MAGIC: [u8; 8] = *b"TACTAMEM";

/// Magic bytes identifying a per-buffer lock block: `"TACTARWL"`.
pub const LOCK_MAGIC: [u8; 8] = *b"TACTARWL";

/// Magic bytes identifying a semaphore block: `"TACTASEM"`.
pub const SEM_MAGIC: [u8; 8] = *b"TACTASEM";

/// Magic bytes identifying a driver topology block: `"TACTADS\0"`.
pub const TOPOLOGY_MAGIC: [u8; 8] = *b"TACTADS\0";

/// Maximum length of a user-chosen name prefix, in bytes.
///
/// Longer prefixes are silently truncated; all derived resource names and
/// registry lookups operate on the truncated form.
pub const MAX_NAME_LEN: usize = 32;

/// Capacity of the producer record table in the kernel registry.
pub const MAX_PRODUCERS: usize = 64;

/// Capacity of the driver record table in the kernel registry.
pub const MAX_DRIVERS: usize = 32;

/// Maximum number of buffers a single producer may publish.
///
/// Kept below 10 so the per-buffer lock suffix (`RW0`..`RW7`) stays within
/// the reserved 3-character role suffix.
pub const MAX_BUFFER_COUNT: usize = 8;

/// Maximum number of distinct sensor types a single driver may serve.
///
/// Exceeding this bound during driver registration is a hard error, never
/// a truncation.
pub const MAX_SENSOR_TYPES: usize = 16;

/// CPU cache line size in bytes.
///
/// Used for alignment of shared headers to prevent false sharing.
pub const CACHE_LINE_SIZE: usize = 64;

/// Memory page size in bytes. All shared blocks are page-rounded.
pub const PAGE_SIZE: usize = 4096;

/// Filename prefix for every TACTA object under `/dev/shm`.
pub const FILE_PREFIX: &str = "tacta_";

//! Buffer-family block layouts: data (`MEM`), per-buffer lock (`RW<i>`)
//! and semaphore (`REQ`/`RES`) blocks.
//!
//! The data block holds the swap protocol state the writer publishes and
//! the readers poll without taking any registry lock: which buffer was
//! last written, which is being written, the per-buffer write stamps and
//! the predicted next swap time.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::consts::{CACHE_LINE_SIZE, DATA_MAGIC, LOCK_MAGIC, MAX_BUFFER_COUNT, PAGE_SIZE, SEM_MAGIC};
use crate::sync::{SharedRwLock, SharedSemaphore};

/// Data block header (128 bytes, cache-line aligned).
#[repr(C, align(64))]
pub struct DataHeader {
    /// Must equal [`DATA_MAGIC`].
    pub magic: [u8; 8],
    /// `size_of::<DataHeader>()` of the creating build.
    pub header_size: u32,
    /// Number of buffers.
    pub buffer_count: u32,
    /// Size of one buffer in bytes.
    pub buffer_size: u64,
    /// Cache-line-rounded distance between consecutive buffers.
    pub buffer_stride: u64,
    /// Index of the buffer currently being written.
    pub writing: AtomicU32,
    /// Index of the last completely written buffer.
    pub last_written: AtomicU32,
    /// Predicted monotonic time of the writer's next swap [ns]. Zero when
    /// the writer publishes no prediction (sporadic writers).
    pub next_swap_ns: AtomicU64,
    /// Completion stamp of the most recent write into each buffer
    /// [monotonic ns]. Zero means never written.
    pub write_stamp_ns: [AtomicU64; MAX_BUFFER_COUNT],
    /// Padding to two cache lines.
    pub _pad: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<DataHeader>(), 128);
const_assert_eq!(core::mem::align_of::<DataHeader>(), 64);

impl DataHeader {
    /// Initialize the header in place. Called once by the creating writer.
    pub fn init(&mut self, buffer_size: u64, buffer_count: u32) {
        self.magic = DATA_MAGIC;
        self.header_size = core::mem::size_of::<Self>() as u32;
        self.buffer_count = buffer_count;
        self.buffer_size = buffer_size;
        self.buffer_stride = buffer_stride(buffer_size as usize) as u64;
        self.writing.store(0, Ordering::Release);
        self.last_written.store(0, Ordering::Release);
        self.next_swap_ns.store(0, Ordering::Release);
        for stamp in &self.write_stamp_ns {
            stamp.store(0, Ordering::Release);
        }
    }

    /// Whether the magic bytes identify a data block.
    pub fn is_magic_valid(&self) -> bool {
        self.magic == DATA_MAGIC
    }

    /// Whether the recorded layout equals the current build's.
    pub fn layout_matches(&self) -> bool {
        self.header_size as usize == core::mem::size_of::<Self>()
    }

    /// Write stamp of buffer `index`.
    pub fn stamp(&self, index: usize) -> u64 {
        self.write_stamp_ns[index].load(Ordering::Acquire)
    }
}

/// Cache-line-rounded distance between consecutive buffers.
pub const fn buffer_stride(buffer_size: usize) -> usize {
    (buffer_size + CACHE_LINE_SIZE - 1) & !(CACHE_LINE_SIZE - 1)
}

/// Total data block size for the given geometry, page-rounded.
pub const fn data_block_size(buffer_size: usize, buffer_count: usize) -> usize {
    let raw = core::mem::size_of::<DataHeader>() + buffer_stride(buffer_size) * buffer_count;
    (raw + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Byte offset of buffer `index` within the data block.
pub const fn buffer_offset(buffer_size: usize, index: usize) -> usize {
    core::mem::size_of::<DataHeader>() + buffer_stride(buffer_size) * index
}

/// Per-buffer lock block (64 bytes).
#[repr(C, align(64))]
pub struct LockBlock {
    /// Must equal [`LOCK_MAGIC`].
    pub magic: [u8; 8],
    /// `size_of::<SharedRwLock>()` of the creating build.
    pub lock_size: u32,
    /// Reserved.
    pub _reserved: u32,
    /// The lock itself.
    pub lock: SharedRwLock,
    /// Padding to a full cache line.
    pub _pad: [u8; 40],
}

const_assert_eq!(core::mem::size_of::<LockBlock>(), 64);

impl LockBlock {
    /// Initialize the block in place.
    pub fn init(&mut self) {
        self.magic = LOCK_MAGIC;
        self.lock_size = core::mem::size_of::<SharedRwLock>() as u32;
        self._reserved = 0;
        self.lock.init();
    }

    /// Whether magic and recorded lock size match the current build.
    pub fn is_valid(&self) -> bool {
        self.magic == LOCK_MAGIC && self.lock_size as usize == core::mem::size_of::<SharedRwLock>()
    }
}

/// Semaphore block (64 bytes), used for both `REQ` and `RES`.
#[repr(C, align(64))]
pub struct SemBlock {
    /// Must equal [`SEM_MAGIC`].
    pub magic: [u8; 8],
    /// `size_of::<SharedSemaphore>()` of the creating build.
    pub sem_size: u32,
    /// The semaphore itself.
    pub sem: SharedSemaphore,
    /// Padding to a full cache line.
    pub _pad: [u8; 48],
}

const_assert_eq!(core::mem::size_of::<SemBlock>(), 64);

impl SemBlock {
    /// Initialize the block in place.
    pub fn init(&mut self) {
        self.magic = SEM_MAGIC;
        self.sem_size = core::mem::size_of::<SharedSemaphore>() as u32;
        self.sem.init();
    }

    /// Whether magic and recorded semaphore size match the current build.
    pub fn is_valid(&self) -> bool {
        self.magic == SEM_MAGIC
            && self.sem_size as usize == core::mem::size_of::<SharedSemaphore>()
    }
}

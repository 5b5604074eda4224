//! Shared memory block lifecycle.
//!
//! A [`Segment`] is one mapped `/dev/shm` file. The creating process owns
//! the file and unlinks it when the segment is released with ownership
//! still held; attachers map the existing file and never unlink. Ownership
//! can be disclaimed (`disown`) when a teardown path decides the file must
//! outlive this process, e.g. while revival is still possible.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::error::{FabricError, FabricResult};

/// Directory every fabric object lives in.
const SHM_DIR: &str = "/dev/shm";

/// One mapped shared memory block.
pub struct Segment {
    name: String,
    path: PathBuf,
    _mmap: MmapMut,
    base: *mut u8,
    len: usize,
    owner: AtomicBool,
}

// SAFETY: the mapping is valid for the lifetime of `_mmap` and the base
// pointer never changes. Concurrent access to the mapped bytes is mediated
// by the process-shared locks placed inside the blocks themselves.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a new block, failing if a file of that name already exists.
    ///
    /// The caller becomes the owner; the file is zero-filled by the
    /// kernel, so freshly created blocks always read as all-zeroes.
    pub fn create_exclusive(name: &str, len: usize) -> FabricResult<Self> {
        let path = PathBuf::from(format!("{SHM_DIR}/{name}"));
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AlreadyExists => FabricError::AlreadyExists {
                    name: name.to_string(),
                },
                _ => FabricError::Io { source: e },
            })?;
        file.set_len(len as u64).map_err(|e| {
            let _ = std::fs::remove_file(&path);
            FabricError::OutOfMemory {
                name: name.to_string(),
            }
            .context_io(e)
        })?;

        // SAFETY: the file is open read/write with its length set above.
        let mut mmap = unsafe {
            MmapOptions::new().populate().map_mut(&file).map_err(|e| {
                let _ = std::fs::remove_file(&path);
                FabricError::Io { source: e }
            })?
        };
        let base = mmap.as_mut_ptr();

        Ok(Self {
            name: name.to_string(),
            path,
            _mmap: mmap,
            base,
            len,
            owner: AtomicBool::new(true),
        })
    }

    /// Attach to an existing block.
    ///
    /// `min_len` guards against mapping a block that is too small to hold
    /// the expected header; a shorter file is a layout mismatch, not a
    /// missing resource.
    pub fn attach(name: &str, min_len: usize) -> FabricResult<Self> {
        let path = PathBuf::from(format!("{SHM_DIR}/{name}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => FabricError::NotFound {
                    name: name.to_string(),
                },
                _ => FabricError::Io { source: e },
            })?;
        let len = file.metadata().map(|m| m.len() as usize)?;
        if len < min_len {
            return Err(FabricError::LayoutMismatch {
                name: name.to_string(),
            });
        }

        // SAFETY: the file is open read/write and at least `len` long.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        Ok(Self {
            name: name.to_string(),
            path,
            _mmap: mmap,
            base,
            len,
            owner: AtomicBool::new(false),
        })
    }

    /// Create the block, or attach if it already exists.
    ///
    /// Returns the segment and whether this call created it. Used only by
    /// the kernel registry, where both outcomes are normal.
    pub fn create_or_attach(name: &str, len: usize) -> FabricResult<(Self, bool)> {
        match Self::create_exclusive(name, len) {
            Ok(segment) => Ok((segment, true)),
            Err(FabricError::AlreadyExists { .. }) => Ok((Self::attach(name, len)?, false)),
            Err(e) => Err(e),
        }
    }

    /// Block name (the `/dev/shm` filename).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty (never true for a valid block).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Reference to a `T` at `offset`.
    ///
    /// # Safety
    /// `offset` must be within the mapping, aligned for `T`, and the bytes
    /// must be a valid `T` under the block's access discipline.
    pub unsafe fn at<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        unsafe { &*(self.base.add(offset) as *const T) }
    }

    /// Mutable reference to a `T` at `offset`.
    ///
    /// # Safety
    /// As [`Segment::at`], and the caller must hold whatever lock grants
    /// exclusive access to that region.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn at_mut<T>(&self, offset: usize) -> &mut T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        unsafe { &mut *(self.base.add(offset) as *mut T) }
    }

    /// Whether this process created the block and still owns the file.
    pub fn is_owner(&self) -> bool {
        self.owner.load(Ordering::Acquire)
    }

    /// Give up ownership: the file will survive this segment's drop.
    pub fn disown(&self) {
        self.owner.store(false, Ordering::Release);
    }

    /// Take ownership: the file will be unlinked on drop. Used when the
    /// last attached process becomes responsible for cleanup.
    pub fn adopt(&self) {
        self.owner.store(true, Ordering::Release);
    }

    /// Unlink the backing file now. Existing mappings (ours and other
    /// processes') stay valid until unmapped.
    pub fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to unlink {}: {e}", self.path.display());
            }
        }
        self.owner.store(false, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.is_owner() {
            self.unlink();
        }
    }
}

impl FabricError {
    /// Attach an IO cause to an error by logging it; the typed error wins.
    fn context_io(self, source: std::io::Error) -> Self {
        tracing::debug!("underlying IO error: {source}");
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(name: &str) -> String {
        format!("tacta_arena_{name}_{}", std::process::id())
    }

    #[test]
    fn create_attach_roundtrip() {
        let name = unique("roundtrip");
        let owner = Segment::create_exclusive(&name, 4096).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.len(), 4096);

        let view = Segment::attach(&name, 4096).unwrap();
        assert!(!view.is_owner());

        // Fresh blocks are zero-filled.
        let word: &u64 = unsafe { view.at::<u64>(0) };
        assert_eq!(*word, 0);
    }

    #[test]
    fn exclusive_create_collides() {
        let name = unique("collide");
        let _first = Segment::create_exclusive(&name, 4096).unwrap();
        assert!(matches!(
            Segment::create_exclusive(&name, 4096),
            Err(FabricError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn attach_missing_is_not_found() {
        assert!(matches!(
            Segment::attach(&unique("missing"), 4096),
            Err(FabricError::NotFound { .. })
        ));
    }

    #[test]
    fn attach_short_block_is_layout_mismatch() {
        let name = unique("short");
        let _owner = Segment::create_exclusive(&name, 4096).unwrap();
        assert!(matches!(
            Segment::attach(&name, 8192),
            Err(FabricError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique("unlink");
        {
            let _owner = Segment::create_exclusive(&name, 4096).unwrap();
        }
        assert!(matches!(
            Segment::attach(&name, 4096),
            Err(FabricError::NotFound { .. })
        ));
    }

    #[test]
    fn disowned_drop_keeps_file() {
        let name = unique("disown");
        {
            let owner = Segment::create_exclusive(&name, 4096).unwrap();
            owner.disown();
        }
        let view = Segment::attach(&name, 4096).unwrap();
        view.adopt();
        // Dropping the adopting view cleans up.
        drop(view);
        assert!(matches!(
            Segment::attach(&name, 4096),
            Err(FabricError::NotFound { .. })
        ));
    }
}

//! The buffer family of one producer: data block, per-buffer locks and
//! the sporadic request/response semaphores.
//!
//! All blocks derive their names from the producer's prefix via the
//! role-suffix convention, are created together by the owning writer and
//! attached together by every reader. Attach validates magic and recorded layout on every
//! block; a disagreement is a layout mismatch, never ignored.

use tacta::consts::MAX_BUFFER_COUNT;
use tacta::layout::data::{buffer_offset, data_block_size};
use tacta::layout::{DataHeader, LockBlock, SemBlock};
use tacta::naming::{resource_name, Role};
use tacta::sync::{SharedRwLock, SharedSemaphore};

use crate::arena::Segment;
use crate::error::{FabricError, FabricResult};

/// One producer's complete set of shared blocks.
pub struct BufferSet {
    data: Segment,
    locks: Vec<Segment>,
    request: Option<Segment>,
    response: Option<Segment>,
    buffer_size: usize,
    buffer_count: usize,
}

impl BufferSet {
    /// Create and initialize every block of the family. Writer side.
    ///
    /// `sporadic` decides whether the request/response semaphores exist.
    /// On any failure the blocks created so far are unlinked by their
    /// segment owners unwinding.
    pub fn create_owned(
        prefix: &str,
        buffer_size: usize,
        buffer_count: usize,
        sporadic: bool,
    ) -> FabricResult<Self> {
        validate_geometry(buffer_size, buffer_count)?;

        let data_name = resource_name(prefix, Role::Data);
        let data = Segment::create_exclusive(&data_name, data_block_size(buffer_size, buffer_count))?;
        // SAFETY: freshly created zero-filled block, exclusively ours
        // until the registry slot is published.
        unsafe { data.at_mut::<DataHeader>(0) }.init(buffer_size as u64, buffer_count as u32);

        let mut locks = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            let lock_name = resource_name(prefix, Role::BufferLock(i));
            let segment =
                Segment::create_exclusive(&lock_name, core::mem::size_of::<LockBlock>())?;
            // SAFETY: as above.
            unsafe { segment.at_mut::<LockBlock>(0) }.init();
            locks.push(segment);
        }

        let (request, response) = if sporadic {
            let req_name = resource_name(prefix, Role::Request);
            let req = Segment::create_exclusive(&req_name, core::mem::size_of::<SemBlock>())?;
            // SAFETY: as above.
            unsafe { req.at_mut::<SemBlock>(0) }.init();

            let res_name = resource_name(prefix, Role::Response);
            let res = Segment::create_exclusive(&res_name, core::mem::size_of::<SemBlock>())?;
            // SAFETY: as above.
            unsafe { res.at_mut::<SemBlock>(0) }.init();
            (Some(req), Some(res))
        } else {
            (None, None)
        };

        Ok(Self {
            data,
            locks,
            request,
            response,
            buffer_size,
            buffer_count,
        })
    }

    /// Attach to an existing family. Reader side, and writer revival.
    ///
    /// The expected geometry comes from the producer's registry record;
    /// every block's recorded layout is validated against it.
    pub fn attach(
        prefix: &str,
        buffer_size: usize,
        buffer_count: usize,
        sporadic: bool,
    ) -> FabricResult<Self> {
        validate_geometry(buffer_size, buffer_count)?;

        let data_name = resource_name(prefix, Role::Data);
        let data = Segment::attach(&data_name, data_block_size(buffer_size, buffer_count))?;
        {
            // SAFETY: block length validated against the header size.
            let header = unsafe { data.at::<DataHeader>(0) };
            if !header.is_magic_valid() || !header.layout_matches() {
                return Err(FabricError::LayoutMismatch { name: data_name });
            }
            if header.buffer_size != buffer_size as u64
                || header.buffer_count != buffer_count as u32
            {
                return Err(FabricError::LayoutMismatch { name: data_name });
            }
        }

        let mut locks = Vec::with_capacity(buffer_count);
        for i in 0..buffer_count {
            let lock_name = resource_name(prefix, Role::BufferLock(i));
            let segment = Segment::attach(&lock_name, core::mem::size_of::<LockBlock>())?;
            // SAFETY: length validated by attach.
            if !unsafe { segment.at::<LockBlock>(0) }.is_valid() {
                return Err(FabricError::LayoutMismatch { name: lock_name });
            }
            locks.push(segment);
        }

        let (request, response) = if sporadic {
            let req_name = resource_name(prefix, Role::Request);
            let req = Segment::attach(&req_name, core::mem::size_of::<SemBlock>())?;
            // SAFETY: length validated by attach.
            if !unsafe { req.at::<SemBlock>(0) }.is_valid() {
                return Err(FabricError::LayoutMismatch { name: req_name });
            }

            let res_name = resource_name(prefix, Role::Response);
            let res = Segment::attach(&res_name, core::mem::size_of::<SemBlock>())?;
            // SAFETY: length validated by attach.
            if !unsafe { res.at::<SemBlock>(0) }.is_valid() {
                return Err(FabricError::LayoutMismatch { name: res_name });
            }
            (Some(req), Some(res))
        } else {
            (None, None)
        };

        Ok(Self {
            data,
            locks,
            request,
            response,
            buffer_size,
            buffer_count,
        })
    }

    /// The swap-protocol header.
    pub fn header(&self) -> &DataHeader {
        // SAFETY: validated at construction.
        unsafe { self.data.at::<DataHeader>(0) }
    }

    /// The lock protecting buffer `index`.
    pub fn lock(&self, index: usize) -> &SharedRwLock {
        // SAFETY: validated at construction.
        let block = unsafe { self.locks[index].at::<LockBlock>(0) };
        &block.lock
    }

    /// The sporadic request semaphore, if this producer is sporadic.
    pub fn request_sem(&self) -> Option<&SharedSemaphore> {
        self.request.as_ref().map(|segment| {
            // SAFETY: validated at construction.
            let block = unsafe { segment.at::<SemBlock>(0) };
            &block.sem
        })
    }

    /// The sporadic response semaphore, if this producer is sporadic.
    pub fn response_sem(&self) -> Option<&SharedSemaphore> {
        self.response.as_ref().map(|segment| {
            // SAFETY: validated at construction.
            let block = unsafe { segment.at::<SemBlock>(0) };
            &block.sem
        })
    }

    /// Size of one buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers.
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Buffer `index` as a shared slice.
    ///
    /// # Safety
    /// The caller must hold the buffer's read lock, or otherwise know the
    /// writer cannot be mutating it (e.g. the last-written buffer while
    /// the writer is filling a different one).
    pub unsafe fn buffer(&self, index: usize) -> &[u8] {
        debug_assert!(index < self.buffer_count);
        let offset = buffer_offset(self.buffer_size, index);
        // SAFETY: geometry validated at construction; access discipline
        // is the caller's obligation per the doc contract.
        unsafe { std::slice::from_raw_parts(self.data.base().add(offset), self.buffer_size) }
    }

    /// Buffer `index` as an exclusive slice.
    ///
    /// # Safety
    /// The caller must hold the buffer's write lock.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer_mut(&self, index: usize) -> &mut [u8] {
        debug_assert!(index < self.buffer_count);
        let offset = buffer_offset(self.buffer_size, index);
        // SAFETY: as above, with the write lock granting exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.data.base().add(offset), self.buffer_size) }
    }

    /// Keep every backing file alive past this set's drop (revival path).
    pub fn disown_all(&self) {
        self.data.disown();
        for lock in &self.locks {
            lock.disown();
        }
        if let Some(req) = &self.request {
            req.disown();
        }
        if let Some(res) = &self.response {
            res.disown();
        }
    }

    /// Unlink every backing file now (final teardown path).
    pub fn unlink_all(&self) {
        self.data.unlink();
        for lock in &self.locks {
            lock.unlink();
        }
        if let Some(req) = &self.request {
            req.unlink();
        }
        if let Some(res) = &self.response {
            res.unlink();
        }
    }
}

fn validate_geometry(buffer_size: usize, buffer_count: usize) -> FabricResult<()> {
    if buffer_size == 0 {
        return Err(FabricError::InvalidArgument {
            reason: "buffer_size must be nonzero".to_string(),
        });
    }
    if buffer_count == 0 || buffer_count > MAX_BUFFER_COUNT {
        return Err(FabricError::InvalidArgument {
            reason: format!("buffer_count must be in 1..={MAX_BUFFER_COUNT}, got {buffer_count}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn unique(name: &str) -> String {
        format!("bufset_{name}_{}", std::process::id())
    }

    #[test]
    fn create_and_attach_family() {
        let prefix = unique("family");
        let owner = BufferSet::create_owned(&prefix, 256, 2, true).unwrap();
        assert_eq!(owner.buffer_count(), 2);
        assert!(owner.request_sem().is_some());

        let view = BufferSet::attach(&prefix, 256, 2, true).unwrap();
        assert_eq!(view.header().buffer_size, 256);
        assert_eq!(view.header().last_written.load(Ordering::Acquire), 0);
    }

    #[test]
    fn attach_with_wrong_geometry_is_mismatch() {
        let prefix = unique("geometry");
        let _owner = BufferSet::create_owned(&prefix, 256, 2, false).unwrap();
        assert!(matches!(
            BufferSet::attach(&prefix, 512, 2, false),
            Err(FabricError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn periodic_family_has_no_semaphores() {
        let prefix = unique("periodic");
        let owner = BufferSet::create_owned(&prefix, 64, 1, false).unwrap();
        assert!(owner.request_sem().is_none());
        assert!(owner.response_sem().is_none());
    }

    #[test]
    fn buffers_are_independent() {
        let prefix = unique("independent");
        let owner = BufferSet::create_owned(&prefix, 64, 2, false).unwrap();

        // SAFETY: single-threaded test, no concurrent writer.
        unsafe {
            owner.buffer_mut(0).fill(0xAA);
            owner.buffer_mut(1).fill(0x55);
            assert!(owner.buffer(0).iter().all(|&b| b == 0xAA));
            assert!(owner.buffer(1).iter().all(|&b| b == 0x55));
        }
    }

    #[test]
    fn geometry_validation() {
        assert!(matches!(
            BufferSet::create_owned(&unique("zero"), 0, 1, false),
            Err(FabricError::InvalidArgument { .. })
        ));
        assert!(matches!(
            BufferSet::create_owned(&unique("many"), 64, MAX_BUFFER_COUNT + 1, false),
            Err(FabricError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn locks_operate_through_the_mapping() {
        let prefix = unique("locks");
        let owner = BufferSet::create_owned(&prefix, 64, 2, false).unwrap();
        let view = BufferSet::attach(&prefix, 64, 2, false).unwrap();

        assert!(owner.lock(0).try_write());
        // The attached view observes the same lock word.
        assert!(!view.lock(0).try_write());
        assert!(view.lock(1).try_read());
        owner.lock(0).unlock_write();
        view.lock(1).unlock_read();
    }
}

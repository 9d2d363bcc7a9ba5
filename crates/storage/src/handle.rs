use std::fmt;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::buffer::BufferPoolManager;
use crate::page::{Page, PageId};
use crate::replacer::FrameId;

pub type PageReadGuard<'a> = RwLockReadGuard<'a, Page>;
pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, Page>;

/// A pinned page. Holding one keeps the frame from being evicted.
///
/// Dropping the handle releases its pin as clean unless `mark_dirty` was
/// called; `unpin` releases early with an explicit dirty flag. While a write
/// guard is held, flushing or deleting the page fails with `PageLatched`.
pub struct PageHandle {
    pool: BufferPoolManager,
    page_id: PageId,
    frame_id: FrameId,
    dirty: bool,
    released: bool,
}

impl PageHandle {
    pub(crate) fn new(pool: BufferPoolManager, page_id: PageId, frame_id: FrameId) -> Self {
        Self {
            pool,
            page_id,
            frame_id,
            dirty: false,
            released: false,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the frame id backing this handle.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    pub fn read(&self) -> PageReadGuard<'_> {
        self.pool.page_lock(self.frame_id).read()
    }

    /// Locks the page bytes for writing. Call `mark_dirty` to have the change
    /// written back.
    pub fn write(&self) -> PageWriteGuard<'_> {
        self.pool.page_lock(self.frame_id).write()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Whether the page will need a write-back, counting this handle's mark.
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.pool.is_dirty(self.page_id).unwrap_or(false)
    }

    /// Releases the pin now with the given dirty flag.
    pub fn unpin(mut self, is_dirty: bool) -> bool {
        self.released = true;
        self.pool.release_handle_pin(self.page_id, is_dirty || self.dirty)
    }

    /// Keeps the pin after the handle is gone. The caller releases it later
    /// with `BufferPoolManager::unpin_page`.
    pub fn detach(mut self) -> PageId {
        self.released = true;
        self.pool.detach_handle_pin(self.page_id, self.dirty);
        self.page_id
    }
}

impl Drop for PageHandle {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release_handle_pin(self.page_id, self.dirty);
        }
    }
}

impl fmt::Debug for PageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandle")
            .field("page_id", &self.page_id)
            .field("frame_id", &self.frame_id)
            .field("dirty", &self.dirty)
            .finish()
    }
}

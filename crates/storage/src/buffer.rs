use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use thiserror::Error;

use crate::disk::{Disk, DiskError};
use crate::handle::PageHandle;
use crate::page::{FileId, Page, PageId};
use crate::replacer::{FrameId, LruReplacer, Replacer};

/// Errors returned by the buffer pool manager.
#[derive(Debug, Error)]
pub enum BufferPoolError {
    /// The underlying disk failed.
    #[error("disk error: {0}")]
    Disk(#[from] DiskError),
    /// A handle holds the page's write guard; retry once it is dropped.
    #[error("page {0} is latched by a write guard")]
    PageLatched(PageId),
    /// An unpinned frame was found latched.
    #[error("frame {0} is latched without a pin")]
    FrameLatched(FrameId),
}

/// Convenience alias for buffer pool results.
pub type BufferPoolResult<T> = Result<T, BufferPoolError>;

#[derive(Debug, Clone, Copy, Default)]
struct FrameMeta {
    page_id: Option<PageId>,
    pin_count: u32,
    // pins owned by live `PageHandle`s, always <= pin_count
    handle_pins: u32,
    is_dirty: bool,
}

/// Where a victim frame came from, so a failed write-back can put it back.
#[derive(Debug, Clone, Copy)]
enum Victim {
    Free(FrameId),
    Evicted(FrameId),
}

impl Victim {
    fn frame_id(self) -> FrameId {
        match self {
            Victim::Free(frame_id) | Victim::Evicted(frame_id) => frame_id,
        }
    }
}

struct BufferPoolState {
    disk: Box<dyn Disk>,
    frames: Vec<FrameMeta>,
    page_table: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
}

struct BufferPoolInner {
    // Page latches are taken by handles before the pool lock. Under the pool
    // lock they are only ever try-locked.
    state: Mutex<BufferPoolState>,
    replacer: LruReplacer,
    pages: Box<[RwLock<Page>]>,
}

/// Buffer pool manager for caching pages between disk and memory.
///
/// Every operation holds the pool-wide lock for its whole duration, disk I/O
/// included. Clones share the same pool.
#[derive(Clone)]
pub struct BufferPoolManager {
    inner: Arc<BufferPoolInner>,
}

impl BufferPoolManager {
    /// Creates a new buffer pool manager with a fixed number of frames.
    pub fn new(disk: impl Disk + 'static, pool_size: usize) -> Self {
        let pages = (0..pool_size).map(|_| RwLock::new(Page::new())).collect();
        let state = BufferPoolState {
            disk: Box::new(disk),
            frames: vec![FrameMeta::default(); pool_size],
            page_table: HashMap::with_capacity(pool_size),
            free_list: (0..pool_size).collect(),
        };
        Self {
            inner: Arc::new(BufferPoolInner {
                state: Mutex::new(state),
                replacer: LruReplacer::new(pool_size),
                pages,
            }),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pages.len()
    }

    /// Fetches a page into memory and pins it.
    ///
    /// Returns `Ok(None)` when every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> BufferPoolResult<Option<PageHandle>> {
        let mut state = self.inner.state.lock();
        if let Some(&frame_id) = state.page_table.get(&page_id) {
            let meta = &mut state.frames[frame_id];
            if meta.pin_count == 0 {
                self.inner.replacer.pin(frame_id);
            }
            meta.pin_count += 1;
            meta.handle_pins += 1;
            trace!("buffer pool hit for page {page_id} in frame {frame_id}");
            return Ok(Some(PageHandle::new(self.clone(), page_id, frame_id)));
        }

        let Some(victim) = self.find_victim(&mut state) else {
            debug!("buffer pool exhausted, cannot load page {page_id}");
            return Ok(None);
        };
        let (frame_id, mut page) = self.clean_victim(&mut state, victim)?;
        if let Err(err) = state.disk.read_page(page_id, page.data_mut()) {
            page.reset();
            drop(page);
            state.free_list.push_front(frame_id);
            return Err(err.into());
        }
        drop(page);
        debug!("buffer pool miss, loaded page {page_id} into frame {frame_id}");
        self.install(&mut state, frame_id, page_id);
        Ok(Some(PageHandle::new(self.clone(), page_id, frame_id)))
    }

    /// Allocates a new page in `file_id` and pins it, zeroed.
    ///
    /// Returns `Ok(None)` when every frame is pinned; nothing is allocated on
    /// disk in that case.
    pub fn new_page(&self, file_id: FileId) -> BufferPoolResult<Option<PageHandle>> {
        let mut state = self.inner.state.lock();
        let Some(victim) = self.find_victim(&mut state) else {
            debug!("buffer pool exhausted, cannot create page in file {file_id}");
            return Ok(None);
        };
        let (frame_id, page) = self.clean_victim(&mut state, victim)?;
        drop(page);
        let page_no = match state.disk.allocate_page(file_id) {
            Ok(page_no) => page_no,
            Err(err) => {
                state.free_list.push_front(frame_id);
                return Err(err.into());
            }
        };
        let page_id = PageId::new(file_id, page_no);
        debug!("created page {page_id} in frame {frame_id}");
        self.install(&mut state, frame_id, page_id);
        Ok(Some(PageHandle::new(self.clone(), page_id, frame_id)))
    }

    /// Releases one detached pin on a page and optionally marks it dirty.
    ///
    /// Pins held by a live `PageHandle` are released by the handle itself, so
    /// this returns `false` if the page is not resident or has no pin left
    /// that came from `PageHandle::detach`. A dirty flag stays set until the
    /// page is flushed.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            warn!("unpin of non-resident page {page_id}");
            return false;
        };
        let meta = &mut state.frames[frame_id];
        if meta.pin_count == 0 {
            warn!("unpin of page {page_id} which is not pinned");
            return false;
        }
        if meta.pin_count <= meta.handle_pins {
            warn!("unpin of page {page_id} whose pins are all held by handles");
            return false;
        }
        self.release_pin(frame_id, meta, is_dirty);
        true
    }

    /// Writes a resident page to disk, dirty or not, and clears its dirty flag.
    ///
    /// Fails with `PageLatched` while a handle holds the page's write guard.
    pub fn flush_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(false);
        };
        {
            let Some(page) = self.inner.pages[frame_id].try_read() else {
                debug!("page {page_id} is write-latched, not flushed");
                return Err(BufferPoolError::PageLatched(page_id));
            };
            state.disk.write_page(page_id, page.data())?;
        }
        state.frames[frame_id].is_dirty = false;
        debug!("flushed page {page_id} from frame {frame_id}");
        Ok(true)
    }

    /// Drops a page from the pool and deallocates it on disk.
    ///
    /// Returns `true` if the page is not resident, `false` if it is pinned.
    pub fn delete_page(&self, page_id: PageId) -> BufferPoolResult<bool> {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            return Ok(true);
        };
        if state.frames[frame_id].pin_count > 0 {
            debug!("refusing to delete pinned page {page_id}");
            return Ok(false);
        }
        let Some(mut page) = self.inner.pages[frame_id].try_write() else {
            return Err(BufferPoolError::PageLatched(page_id));
        };
        state.disk.deallocate_page(page_id)?;
        page.reset();
        drop(page);

        state.page_table.remove(&page_id);
        state.frames[frame_id] = FrameMeta::default();
        self.inner.replacer.pin(frame_id);
        state.free_list.push_back(frame_id);
        debug!("deleted page {page_id}, frame {frame_id} is free");
        Ok(true)
    }

    /// Writes every resident page of `file_id` to disk, pinned or not, then
    /// syncs the file.
    ///
    /// Pages that are write-latched are skipped and stay dirty; the first of
    /// them is reported as `PageLatched` after the rest are written and synced.
    pub fn flush_all_pages(&self, file_id: FileId) -> BufferPoolResult<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let mut flushed = 0usize;
        let mut latched = None;
        for (frame_id, meta) in state.frames.iter_mut().enumerate() {
            let Some(page_id) = meta.page_id.filter(|id| id.file_id == file_id) else {
                continue;
            };
            let Some(page) = self.inner.pages[frame_id].try_read() else {
                latched.get_or_insert(page_id);
                continue;
            };
            state.disk.write_page(page_id, page.data())?;
            meta.is_dirty = false;
            flushed += 1;
        }
        state.disk.sync(file_id)?;
        debug!("flushed {flushed} pages of file {file_id}");
        match latched {
            Some(page_id) => Err(BufferPoolError::PageLatched(page_id)),
            None => Ok(()),
        }
    }

    /// Returns whether a page currently occupies a frame.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.inner.state.lock().page_table.contains_key(&page_id)
    }

    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.frame_meta(page_id).map(|meta| meta.pin_count)
    }

    pub fn is_dirty(&self, page_id: PageId) -> Option<bool> {
        self.frame_meta(page_id).map(|meta| meta.is_dirty)
    }

    pub fn free_frame_count(&self) -> usize {
        self.inner.state.lock().free_list.len()
    }

    /// Number of resident frames that could be evicted right now.
    pub fn evictable_count(&self) -> usize {
        let _state = self.inner.state.lock();
        self.inner.replacer.size()
    }

    pub(crate) fn page_lock(&self, frame_id: FrameId) -> &RwLock<Page> {
        &self.inner.pages[frame_id]
    }

    /// Releases the pin owned by a dropped or unpinned handle.
    pub(crate) fn release_handle_pin(&self, page_id: PageId, is_dirty: bool) -> bool {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            warn!("handle for non-resident page {page_id}");
            return false;
        };
        let meta = &mut state.frames[frame_id];
        if meta.handle_pins == 0 {
            warn!("handle for page {page_id} has no pin to release");
            return false;
        }
        meta.handle_pins -= 1;
        self.release_pin(frame_id, meta, is_dirty);
        true
    }

    /// Hands a handle's pin over to the caller for a later `unpin_page`.
    pub(crate) fn detach_handle_pin(&self, page_id: PageId, is_dirty: bool) {
        let mut state = self.inner.state.lock();
        let Some(&frame_id) = state.page_table.get(&page_id) else {
            warn!("handle for non-resident page {page_id}");
            return;
        };
        let meta = &mut state.frames[frame_id];
        meta.handle_pins = meta.handle_pins.saturating_sub(1);
        if is_dirty {
            meta.is_dirty = true;
        }
    }

    fn release_pin(&self, frame_id: FrameId, meta: &mut FrameMeta, is_dirty: bool) {
        if is_dirty {
            meta.is_dirty = true;
        }
        meta.pin_count -= 1;
        if meta.pin_count == 0 {
            self.inner.replacer.unpin(frame_id);
        }
    }

    fn frame_meta(&self, page_id: PageId) -> Option<FrameMeta> {
        let state = self.inner.state.lock();
        let frame_id = *state.page_table.get(&page_id)?;
        Some(state.frames[frame_id])
    }

    fn find_victim(&self, state: &mut BufferPoolState) -> Option<Victim> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Some(Victim::Free(frame_id));
        }
        self.inner.replacer.victim().map(Victim::Evicted)
    }

    /// Writes back and unmaps the victim's old page, returning the zeroed
    /// frame still latched for writing.
    fn clean_victim(
        &self,
        state: &mut BufferPoolState,
        victim: Victim,
    ) -> BufferPoolResult<(FrameId, RwLockWriteGuard<'_, Page>)> {
        let frame_id = victim.frame_id();
        // unpinned frames have no handles, so this only fails on a broken pin count
        let Some(mut page) = self.inner.pages[frame_id].try_write() else {
            self.restore_victim(state, victim);
            return Err(BufferPoolError::FrameLatched(frame_id));
        };
        let FrameMeta {
            page_id, is_dirty, ..
        } = state.frames[frame_id];

        if let Some(old_page_id) = page_id {
            if is_dirty {
                if let Err(err) = state.disk.write_page(old_page_id, page.data()) {
                    drop(page);
                    self.restore_victim(state, victim);
                    return Err(err.into());
                }
                debug!("wrote back dirty page {old_page_id} from frame {frame_id}");
            }
            state.page_table.remove(&old_page_id);
            debug!("evicted page {old_page_id} from frame {frame_id}");
        }

        state.frames[frame_id] = FrameMeta::default();
        page.reset();
        Ok((frame_id, page))
    }

    /// Puts a victim back exactly where it was taken from.
    fn restore_victim(&self, state: &mut BufferPoolState, victim: Victim) {
        match victim {
            Victim::Free(frame_id) => state.free_list.push_front(frame_id),
            Victim::Evicted(frame_id) => self.inner.replacer.restore_oldest(frame_id),
        }
    }

    fn install(&self, state: &mut BufferPoolState, frame_id: FrameId, page_id: PageId) {
        state.frames[frame_id] = FrameMeta {
            page_id: Some(page_id),
            pin_count: 1,
            handle_pins: 1,
            is_dirty: false,
        };
        state.page_table.insert(page_id, frame_id);
        self.inner.replacer.pin(frame_id);
    }
}

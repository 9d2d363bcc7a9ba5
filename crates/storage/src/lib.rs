//! Buffer pool for a disk-backed storage engine.
//!
//! `BufferPoolManager` caches fixed-size pages in a fixed arena of frames,
//! evicting unpinned frames in LRU order and writing dirty ones back through
//! a `Disk`.

mod buffer;
mod disk;
mod handle;
mod mem_disk;
mod page;
mod replacer;

pub use buffer::{BufferPoolError, BufferPoolManager, BufferPoolResult};
pub use disk::{Disk, DiskError, DiskManager, DiskResult};
pub use handle::{PageHandle, PageReadGuard, PageWriteGuard};
pub use mem_disk::MemDisk;
pub use page::{FileId, PAGE_SIZE, Page, PageId, PageNumber};
pub use replacer::{FrameId, LruReplacer, Replacer};

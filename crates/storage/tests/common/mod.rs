#![allow(dead_code)]

use storage::{BufferPoolManager, DiskManager, FileId, MemDisk, PageId};
use tempfile::TempDir;

pub const FILE: FileId = 0;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mem_pool(pool_size: usize) -> (MemDisk, BufferPoolManager) {
    init_logging();
    let disk = MemDisk::new();
    let bpm = BufferPoolManager::new(disk.clone(), pool_size);
    (disk, bpm)
}

/// File-backed pool; keep the `TempDir` alive for the test's duration.
pub fn file_pool(pool_size: usize) -> (TempDir, FileId, BufferPoolManager) {
    init_logging();
    let dir = TempDir::new().expect("temp dir create failed");
    let mut disk_manager = DiskManager::new();
    let file_id = disk_manager
        .open_file(dir.path().join("pool.db"))
        .expect("open data file");
    (dir, file_id, BufferPoolManager::new(disk_manager, pool_size))
}

/// Allocates `count` pages and leaves them unpinned and clean.
pub fn allocate_unpinned(bpm: &BufferPoolManager, file_id: FileId, count: usize) -> Vec<PageId> {
    (0..count)
        .map(|_| {
            bpm.new_page(file_id)
                .expect("disk error")
                .expect("pool exhausted")
                .page_id()
        })
        .collect()
}

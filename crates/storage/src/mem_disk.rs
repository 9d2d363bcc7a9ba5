use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::disk::{Disk, DiskError, DiskResult, check_buffer};
use crate::page::{FileId, PAGE_SIZE, PageId, PageNumber};

#[derive(Default)]
struct MemState {
    pages: HashMap<PageId, Box<[u8; PAGE_SIZE]>>,
    next_page_no: HashMap<FileId, PageNumber>,
    reads: u64,
    writes: u64,
    allocations: u64,
    deallocations: u64,
    syncs: u64,
    fail_next_read: bool,
    fail_next_write: bool,
}

/// In-memory disk for ephemeral pools and tests.
///
/// Clones share the same pages and counters, so a test can hand one clone to
/// a pool and observe I/O through another. Any file id is accepted; page
/// numbers start at 1 like the file-backed manager.
#[derive(Clone, Default)]
pub struct MemDisk {
    state: Arc<Mutex<MemState>>,
}

impl MemDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.state.lock().reads
    }

    pub fn writes(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn allocations(&self) -> u64 {
        self.state.lock().allocations
    }

    pub fn deallocations(&self) -> u64 {
        self.state.lock().deallocations
    }

    pub fn syncs(&self) -> u64 {
        self.state.lock().syncs
    }

    /// Copy of the stored bytes of an allocated page.
    pub fn page_bytes(&self, page_id: PageId) -> Option<Vec<u8>> {
        self.state.lock().pages.get(&page_id).map(|p| p.to_vec())
    }

    /// Makes the next `read_page` call fail with an I/O error.
    pub fn fail_next_read(&self) {
        self.state.lock().fail_next_read = true;
    }

    /// Makes the next `write_page` call fail with an I/O error.
    pub fn fail_next_write(&self) {
        self.state.lock().fail_next_write = true;
    }
}

fn injected(op: &str) -> DiskError {
    DiskError::Io(io::Error::other(format!("injected {op} failure")))
}

impl Disk for MemDisk {
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> DiskResult<()> {
        check_buffer(buf.len())?;
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_read) {
            return Err(injected("read"));
        }
        let page = state
            .pages
            .get(&page_id)
            .ok_or(DiskError::PageNotAllocated(page_id))?;
        buf.copy_from_slice(&page[..]);
        state.reads += 1;
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> DiskResult<()> {
        check_buffer(buf.len())?;
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next_write) {
            return Err(injected("write"));
        }
        let page = state
            .pages
            .get_mut(&page_id)
            .ok_or(DiskError::PageNotAllocated(page_id))?;
        page.copy_from_slice(buf);
        state.writes += 1;
        Ok(())
    }

    fn allocate_page(&mut self, file_id: FileId) -> DiskResult<PageNumber> {
        let mut state = self.state.lock();
        let next = state.next_page_no.entry(file_id).or_insert(1);
        let page_no = *next;
        *next += 1;
        state
            .pages
            .insert(PageId::new(file_id, page_no), Box::new([0u8; PAGE_SIZE]));
        state.allocations += 1;
        Ok(page_no)
    }

    fn deallocate_page(&mut self, page_id: PageId) -> DiskResult<()> {
        let mut state = self.state.lock();
        if state.pages.remove(&page_id).is_none() {
            return Err(DiskError::PageNotAllocated(page_id));
        }
        state.deallocations += 1;
        Ok(())
    }

    fn sync(&mut self, _file_id: FileId) -> DiskResult<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_pages_and_counters() {
        let mut disk = MemDisk::new();
        let observer = disk.clone();

        let page_no = disk.allocate_page(4).unwrap();
        assert_eq!(page_no, 1);
        assert_eq!(disk.allocate_page(5).unwrap(), 1, "numbering is per file");

        let page_id = PageId::new(4, page_no);
        disk.write_page(page_id, &[9u8; PAGE_SIZE]).unwrap();
        assert_eq!(observer.writes(), 1);
        assert_eq!(observer.page_bytes(page_id).unwrap(), vec![9u8; PAGE_SIZE]);

        disk.deallocate_page(page_id).unwrap();
        assert!(observer.page_bytes(page_id).is_none());
        assert!(disk.deallocate_page(page_id).is_err());
    }

    #[test]
    fn test_injected_failures_fire_once() {
        let mut disk = MemDisk::new();
        let page_id = PageId::new(0, disk.allocate_page(0).unwrap());
        let mut buf = [0u8; PAGE_SIZE];

        disk.fail_next_read();
        assert!(disk.read_page(page_id, &mut buf).is_err());
        assert!(disk.read_page(page_id, &mut buf).is_ok());

        disk.fail_next_write();
        assert!(disk.write_page(page_id, &buf).is_err());
        assert!(disk.write_page(page_id, &buf).is_ok());
        assert_eq!(disk.writes(), 1);
        assert_eq!(disk.reads(), 1);
    }
}

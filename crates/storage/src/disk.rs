//! Disk layer consumed by the buffer pool.
//!
//! Invariants of the file-backed `DiskManager`:
//! - Page 0 of every data file is a reserved header storing next_page_no as u64 (bytes 0..8)
//! - Allocation persists the header before returning
//! - No page number is ever reused within a file, deallocation only scrubs content
//! - Pages outside 1..next_page_no are rejected

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::page::{FileId, PAGE_SIZE, PageId, PageNumber};

const HEADER_SIZE: usize = PAGE_SIZE; // header occupies page 0

/// Errors surfaced by a disk implementation.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("disk io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown file {0}")]
    UnknownFile(FileId),
    #[error("page {0} is not allocated")]
    PageNotAllocated(PageId),
    #[error("buffer is {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

pub type DiskResult<T> = Result<T, DiskError>;

/// Fixed-size page storage the buffer pool reads from and writes back to.
///
/// Calls are synchronous. Page numbers handed out by `allocate_page` are
/// unique and increasing per file.
pub trait Disk: Send {
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> DiskResult<()>;

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> DiskResult<()>;

    fn allocate_page(&mut self, file_id: FileId) -> DiskResult<PageNumber>;

    fn deallocate_page(&mut self, page_id: PageId) -> DiskResult<()>;

    /// Makes previous writes to `file_id` durable.
    fn sync(&mut self, file_id: FileId) -> DiskResult<()>;
}

pub(crate) fn check_buffer(len: usize) -> DiskResult<()> {
    if len != PAGE_SIZE {
        return Err(DiskError::BufferSize {
            expected: PAGE_SIZE,
            actual: len,
        });
    }
    Ok(())
}

struct Header {
    next_page_no: PageNumber, // always points to next free (monotonic, persistent)
}

impl Header {
    fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&self.next_page_no.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&buf[..8]);
        Self {
            next_page_no: u64::from_le_bytes(b),
        }
    }
}

struct DataFile {
    file: File,
    header: Header,
    path: PathBuf,
}

impl DataFile {
    fn open(path: &Path) -> DiskResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let header = if file.metadata()?.len() < HEADER_SIZE as u64 {
            // brand new file
            let header = Header { next_page_no: 1 };
            file.write_all_at(&header.to_bytes(), 0)?;
            file.sync_data()?;
            header
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            file.read_exact_at(&mut buf, 0)?;
            Header::from_bytes(&buf)
        };
        Ok(Self {
            file,
            header,
            path: path.to_path_buf(),
        })
    }

    fn offset(&self, page_id: PageId) -> DiskResult<u64> {
        if page_id.page_no == 0 || page_id.page_no >= self.header.next_page_no {
            return Err(DiskError::PageNotAllocated(page_id));
        }
        page_id
            .page_no
            .checked_mul(PAGE_SIZE as u64)
            .ok_or(DiskError::PageNotAllocated(page_id))
    }
}

/// File-backed disk manager holding any number of open data files.
pub struct DiskManager {
    files: HashMap<FileId, DataFile>,
    next_file_id: FileId,
}

impl DiskManager {
    pub fn new() -> Self {
        Self {
            files: HashMap::new(),
            next_file_id: 0,
        }
    }

    /// Opens or creates a data file, loading or initializing its header.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> DiskResult<FileId> {
        let data_file = DataFile::open(path.as_ref())?;
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        debug!(
            "opened data file {} as {} (next page {})",
            data_file.path.display(),
            file_id,
            data_file.header.next_page_no
        );
        self.files.insert(file_id, data_file);
        Ok(file_id)
    }

    /// Syncs and forgets a data file. Its id is not reused.
    pub fn close_file(&mut self, file_id: FileId) -> DiskResult<()> {
        let data_file = self
            .files
            .remove(&file_id)
            .ok_or(DiskError::UnknownFile(file_id))?;
        data_file.file.sync_all()?;
        Ok(())
    }

    /// Returns the number the next allocation in `file_id` will receive.
    pub fn next_page_no(&self, file_id: FileId) -> DiskResult<PageNumber> {
        Ok(self.file(file_id)?.header.next_page_no)
    }

    fn file(&self, file_id: FileId) -> DiskResult<&DataFile> {
        self.files
            .get(&file_id)
            .ok_or(DiskError::UnknownFile(file_id))
    }

    fn file_mut(&mut self, file_id: FileId) -> DiskResult<&mut DataFile> {
        self.files
            .get_mut(&file_id)
            .ok_or(DiskError::UnknownFile(file_id))
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk for DiskManager {
    fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> DiskResult<()> {
        check_buffer(buf.len())?;
        let data_file = self.file(page_id.file_id)?;
        let offset = data_file.offset(page_id)?;
        data_file.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> DiskResult<()> {
        check_buffer(buf.len())?;
        let data_file = self.file(page_id.file_id)?;
        let offset = data_file.offset(page_id)?;
        data_file.file.write_all_at(buf, offset)?;
        Ok(())
    }

    /// Extends the file with a zero page, then updates and persists the header.
    fn allocate_page(&mut self, file_id: FileId) -> DiskResult<PageNumber> {
        let data_file = self.file_mut(file_id)?;
        let page_no = data_file.header.next_page_no;
        let offset = page_no * PAGE_SIZE as u64;
        data_file.file.write_all_at(&[0u8; PAGE_SIZE], offset)?;
        let header = Header {
            next_page_no: page_no + 1,
        };
        data_file.file.write_all_at(&header.to_bytes(), 0)?;
        data_file.file.sync_data()?;
        data_file.header = header;
        Ok(page_no)
    }

    fn deallocate_page(&mut self, page_id: PageId) -> DiskResult<()> {
        let data_file = self.file(page_id.file_id)?;
        let offset = data_file.offset(page_id)?;
        data_file.file.write_all_at(&[0u8; PAGE_SIZE], offset)?;
        Ok(())
    }

    fn sync(&mut self, file_id: FileId) -> DiskResult<()> {
        self.file(file_id)?.file.sync_data()?;
        Ok(())
    }
}

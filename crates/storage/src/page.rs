use std::fmt;

/// Size of every on-disk page and in-memory frame, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Identifies an open data file inside a disk manager.
pub type FileId = u32;

/// Position of a page inside its data file.
pub type PageNumber = u64;

/// Logical identity of a page: the file it lives in and its number there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub file_id: FileId,
    pub page_no: PageNumber,
}

impl PageId {
    pub fn new(file_id: FileId, page_no: PageNumber) -> Self {
        Self { file_id, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_no)
    }
}

/// Byte content of one buffer pool frame.
#[derive(Debug, Clone)]
pub struct Page {
    data: [u8; PAGE_SIZE],
}

impl Page {
    /// Creates a zeroed page.
    pub fn new() -> Self {
        Self {
            data: [0u8; PAGE_SIZE],
        }
    }

    /// Returns the entire page data.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Returns a mutable reference to the entire page data.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Reads a slice of bytes from the page.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if offset.checked_add(len)? > PAGE_SIZE {
            return None;
        }
        Some(&self.data[offset..offset + len])
    }

    /// Writes bytes into the page at the given offset.
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= PAGE_SIZE => {
                self.data[offset..end].copy_from_slice(bytes);
                true
            }
            _ => false,
        }
    }

    /// Zeroes all content.
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

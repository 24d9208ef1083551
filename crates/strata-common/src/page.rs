//! Page structures for Strata storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Unique identifier for a page within a page store.
///
/// PageId consists of a file ID and page number within that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// File identifier (one file per table or index).
    pub file_id: u32,
    /// Page number within the file (0-indexed).
    pub page_num: u32,
}

impl PageId {
    /// Creates a new PageId.
    pub fn new(file_id: u32, page_num: u32) -> Self {
        Self { file_id, page_num }
    }

    /// Returns the PageId as a single u64 for compact storage.
    pub fn as_u64(&self) -> u64 {
        ((self.file_id as u64) << 32) | (self.page_num as u64)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_num)
    }
}

/// A fixed-size page buffer tagged with its location.
///
/// Offsets are byte positions from the start of the page. All multi-byte
/// integers are little-endian. Accessors panic on out-of-range offsets, which
/// callers rule out through fixed layouts computed from `PAGE_SIZE`.
#[derive(Clone)]
pub struct Page {
    page_id: PageId,
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Creates a zero-filled page.
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Creates a page from raw page data.
    pub fn from_bytes(page_id: PageId, data: [u8; PAGE_SIZE]) -> Self {
        Self {
            page_id,
            data: Box::new(data),
        }
    }

    /// Returns the page identifier.
    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page number within its file.
    #[inline]
    pub fn page_num(&self) -> u32 {
        self.page_id.page_num
    }

    /// Returns the raw page data.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Reads `len` bytes starting at `offset`.
    #[inline]
    pub fn read_bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Writes `bytes` starting at `offset`.
    #[inline]
    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    #[inline]
    pub fn read_u8(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    #[inline]
    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.data[offset] = value;
    }

    #[inline]
    pub fn read_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    #[inline]
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("page_id", &self.page_id).finish()
    }
}

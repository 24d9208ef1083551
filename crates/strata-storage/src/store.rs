//! In-memory page store for temporary tables.

use crate::disk::PageStore;
use parking_lot::RwLock;
use std::collections::HashMap;
use strata_common::page::{Page, PageId, PAGE_SIZE};
use strata_common::{Result, StrataError};

/// In-memory page storage.
///
/// Pages are kept per file in a Vec; page numbers map directly to Vec indices.
/// Nothing is persisted, which makes this the backing store for the
/// short-lived tables that joins and sorts materialize.
#[derive(Default)]
pub struct MemoryPageStore {
    files: RwLock<HashMap<u32, Vec<Box<[u8; PAGE_SIZE]>>>>,
}

impl MemoryPageStore {
    /// Creates a new empty page store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pages held across all files.
    pub fn total_pages(&self) -> usize {
        self.files.read().values().map(Vec::len).sum()
    }
}

impl PageStore for MemoryPageStore {
    fn create_file(&self, file_id: u32) -> Result<()> {
        self.files.write().entry(file_id).or_default();
        Ok(())
    }

    fn allocate_page(&self, file_id: u32) -> Result<PageId> {
        let mut files = self.files.write();
        let pages = files
            .get_mut(&file_id)
            .ok_or(StrataError::FileNotFound(file_id))?;
        let page_num = u32::try_from(pages.len()).map_err(|_| {
            StrataError::StorageExhausted(format!("file {} has no page numbers left", file_id))
        })?;
        pages.push(Box::new([0u8; PAGE_SIZE]));
        Ok(PageId::new(file_id, page_num))
    }

    fn read_page(&self, page_id: PageId) -> Result<Page> {
        let files = self.files.read();
        let data = files
            .get(&page_id.file_id)
            .ok_or(StrataError::FileNotFound(page_id.file_id))?
            .get(page_id.page_num as usize)
            .ok_or(StrataError::PageNotFound {
                page_id: page_id.as_u64(),
            })?;
        Ok(Page::from_bytes(page_id, **data))
    }

    fn write_page(&self, page: &Page) -> Result<()> {
        let page_id = page.page_id();
        let mut files = self.files.write();
        let data = files
            .get_mut(&page_id.file_id)
            .ok_or(StrataError::FileNotFound(page_id.file_id))?
            .get_mut(page_id.page_num as usize)
            .ok_or(StrataError::PageNotFound {
                page_id: page_id.as_u64(),
            })?;
        data.copy_from_slice(page.as_bytes());
        Ok(())
    }

    fn num_pages(&self, file_id: u32) -> Result<u32> {
        let files = self.files.read();
        Ok(files.get(&file_id).map_or(0, |pages| pages.len() as u32))
    }

    fn delete_file(&self, file_id: u32) -> Result<()> {
        self.files.write().remove(&file_id);
        Ok(())
    }
}

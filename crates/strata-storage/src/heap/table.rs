//! Heap table: a header page followed by fixed-slot data pages.
//!
//! Page 0 holds the schema. Every later page is a data page laid out by
//! [`PageLayout`]. The set of data pages with at least one free slot is kept
//! in memory and rebuilt from the bitmaps when a table is opened.

use super::constants::{FIRST_DATA_PAGE, HEADER_PAGE_NUM};
use super::page::PageLayout;
use super::scan::{TableCursor, TableIter};
use crate::disk::PageStore;
use crate::record::{Record, RecordId};
use crate::schema::Schema;
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use strata_common::page::{Page, PageId};
use strata_common::{DataBox, Result, StrataError};

/// A table of fixed-width records stored in one page-store file.
pub struct HeapTable {
    /// Table name, used in logs and errors.
    name: String,
    /// File holding the header page and the data pages.
    file_id: u32,
    /// Backing page store.
    store: Arc<dyn PageStore>,
    /// Schema persisted in the header page.
    schema: Schema,
    /// Slot geometry of every data page.
    layout: PageLayout,
    /// Data pages with at least one clear bitmap bit.
    free_pages: Mutex<BTreeSet<u32>>,
    /// Number of live records.
    num_records: AtomicUsize,
    /// Cached page count of the file, header page included.
    num_pages: AtomicU32,
    /// Temporary tables release their file when dropped.
    temporary: bool,
}

impl HeapTable {
    /// Creates a new table in an empty file and writes its header page.
    pub fn create(
        store: Arc<dyn PageStore>,
        file_id: u32,
        name: impl Into<String>,
        schema: Schema,
    ) -> Result<Self> {
        Self::create_with(store, file_id, name.into(), schema, false)
    }

    /// Creates a table whose file is deleted when the table is dropped.
    pub fn create_temporary(
        store: Arc<dyn PageStore>,
        file_id: u32,
        name: impl Into<String>,
        schema: Schema,
    ) -> Result<Self> {
        Self::create_with(store, file_id, name.into(), schema, true)
    }

    fn create_with(
        store: Arc<dyn PageStore>,
        file_id: u32,
        name: String,
        schema: Schema,
        temporary: bool,
    ) -> Result<Self> {
        let layout = Self::layout_for(&schema)?;
        if store.num_pages(file_id)? != 0 {
            return Err(StrataError::TableAlreadyExists(name));
        }

        store.create_file(file_id)?;
        let header_id = store.allocate_page(file_id)?;
        let mut header = Page::new(header_id);
        schema.write_header(&mut header)?;
        store.write_page(&header)?;

        debug!(
            "created table {} in file {} with {} slots per page",
            name,
            file_id,
            layout.entries_per_page()
        );

        Ok(Self {
            name,
            file_id,
            store,
            schema,
            layout,
            free_pages: Mutex::new(BTreeSet::new()),
            num_records: AtomicUsize::new(0),
            num_pages: AtomicU32::new(1),
            temporary,
        })
    }

    /// Opens an existing table, rebuilding the free-page set and record
    /// count from the data page bitmaps.
    pub fn open(store: Arc<dyn PageStore>, file_id: u32, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let num_pages = store.num_pages(file_id)?;
        if num_pages == 0 {
            return Err(StrataError::TableNotFound(name));
        }

        let header = store.read_page(PageId::new(file_id, HEADER_PAGE_NUM))?;
        let schema = Schema::read_header(&header)?;
        let layout = Self::layout_for(&schema)?;

        let mut free_pages = BTreeSet::new();
        let mut num_records = 0;
        for page_num in FIRST_DATA_PAGE..num_pages {
            let page = store.read_page(PageId::new(file_id, page_num))?;
            let live = layout.live_count(&page);
            num_records += live;
            if live < layout.entries_per_page() {
                free_pages.insert(page_num);
            }
        }

        debug!(
            "opened table {} in file {}: {} records over {} data pages",
            name,
            file_id,
            num_records,
            num_pages - FIRST_DATA_PAGE
        );

        Ok(Self {
            name,
            file_id,
            store,
            schema,
            layout,
            free_pages: Mutex::new(free_pages),
            num_records: AtomicUsize::new(num_records),
            num_pages: AtomicU32::new(num_pages),
            temporary: false,
        })
    }

    fn layout_for(schema: &Schema) -> Result<PageLayout> {
        if schema.is_empty() {
            return Err(StrataError::SchemaMismatch(
                "a table needs at least one column".to_string(),
            ));
        }
        let layout = PageLayout::for_entry_size(schema.entry_size());
        if layout.entries_per_page() == 0 {
            return Err(StrataError::SchemaMismatch(format!(
                "records of {} bytes do not fit a page",
                schema.entry_size()
            )));
        }
        Ok(layout)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Returns the number of live records.
    pub fn num_records(&self) -> usize {
        self.num_records.load(Ordering::Relaxed)
    }

    /// Returns the number of record slots in each data page.
    pub fn num_entries_per_page(&self) -> usize {
        self.layout.entries_per_page()
    }

    /// Returns the size of the slot bitmap that starts each data page.
    pub fn page_header_size(&self) -> usize {
        self.layout.bitmap_size()
    }

    /// Returns the number of data pages (the header page is not counted).
    pub fn num_data_pages(&self) -> u32 {
        self.num_pages.load(Ordering::Acquire) - FIRST_DATA_PAGE
    }

    /// Returns the data page numbers in ascending order.
    pub fn data_page_numbers(&self) -> Range<u32> {
        FIRST_DATA_PAGE..self.num_pages.load(Ordering::Acquire)
    }

    pub(crate) fn layout(&self) -> &PageLayout {
        &self.layout
    }

    /// Reads one data page.
    pub fn fetch_page(&self, page_num: u32) -> Result<Page> {
        if !self.data_page_numbers().contains(&page_num) {
            return Err(StrataError::PageNotFound {
                page_id: PageId::new(self.file_id, page_num).as_u64(),
            });
        }
        self.store.read_page(PageId::new(self.file_id, page_num))
    }

    /// Decodes the live records of a data page in slot order.
    pub fn records_in_page(&self, page: &Page) -> Result<Vec<Record>> {
        let mut records = Vec::with_capacity(self.layout.live_count(page));
        let mut slot = 0;
        while let Some(live) = self.layout.next_live_slot(page, slot) {
            records.push(self.schema.decode(self.layout.read_slot(page, live))?);
            slot = live + 1;
        }
        Ok(records)
    }

    /// Inserts a record into the lowest-numbered page with a free slot,
    /// allocating a new data page when none has room.
    pub fn add_record(&self, values: Vec<DataBox>) -> Result<RecordId> {
        let record = self.schema.verify(values)?;
        let bytes = self.schema.encode(&record)?;

        let mut free_pages = self.free_pages.lock();
        let mut page = match free_pages.first() {
            Some(&page_num) => self.store.read_page(PageId::new(self.file_id, page_num))?,
            None => {
                let page_id = self.store.allocate_page(self.file_id)?;
                self.num_pages
                    .store(page_id.page_num + 1, Ordering::Release);
                free_pages.insert(page_id.page_num);
                trace!("table {} allocated data page {}", self.name, page_id.page_num);
                Page::new(page_id)
            }
        };
        let page_num = page.page_num();

        let slot = self.layout.first_free_slot(&page).ok_or_else(|| {
            StrataError::Internal(format!(
                "page {} of table {} is tracked as free but has no free slot",
                page_num, self.name
            ))
        })?;

        self.layout.write_slot(&mut page, slot, &bytes);
        self.layout.set_live(&mut page, slot, true);
        self.store.write_page(&page)?;

        if self.layout.is_full(&page) {
            free_pages.remove(&page_num);
        }
        self.num_records.fetch_add(1, Ordering::Relaxed);

        Ok(RecordId::new(page_num, slot as u32))
    }

    /// Reads the page of `rid` after checking that it names a live record.
    fn checked_page(&self, rid: RecordId) -> Result<Page> {
        let invalid = StrataError::InvalidRecordId {
            page_num: rid.page_num,
            slot: rid.slot,
        };
        if !self.data_page_numbers().contains(&rid.page_num)
            || rid.slot as usize >= self.layout.entries_per_page()
        {
            return Err(invalid);
        }
        let page = self.store.read_page(PageId::new(self.file_id, rid.page_num))?;
        if !self.layout.is_live(&page, rid.slot as usize) {
            return Err(invalid);
        }
        Ok(page)
    }

    /// Returns the record stored at `rid`.
    pub fn get_record(&self, rid: RecordId) -> Result<Record> {
        let page = self.checked_page(rid)?;
        self.schema
            .decode(self.layout.read_slot(&page, rid.slot as usize))
    }

    /// Deletes the record at `rid` and returns it.
    ///
    /// Only the bitmap bit is cleared; the slot bytes stay behind.
    pub fn delete_record(&self, rid: RecordId) -> Result<Record> {
        let mut free_pages = self.free_pages.lock();
        let mut page = self.checked_page(rid)?;
        let old = self
            .schema
            .decode(self.layout.read_slot(&page, rid.slot as usize))?;

        self.layout.set_live(&mut page, rid.slot as usize, false);
        self.store.write_page(&page)?;

        free_pages.insert(rid.page_num);
        self.num_records.fetch_sub(1, Ordering::Relaxed);
        Ok(old)
    }

    /// Overwrites the record at `rid` in place and returns the old record.
    pub fn update_record(&self, values: Vec<DataBox>, rid: RecordId) -> Result<Record> {
        let _guard = self.free_pages.lock();
        let mut page = self.checked_page(rid)?;
        let record = self.schema.verify(values)?;
        let bytes = self.schema.encode(&record)?;

        let old = self
            .schema
            .decode(self.layout.read_slot(&page, rid.slot as usize))?;
        self.layout.write_slot(&mut page, rid.slot as usize, &bytes);
        self.store.write_page(&page)?;
        Ok(old)
    }

    /// Returns a fresh iterator over all live records in (page, slot) order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter::new(self)
    }

    /// Returns a fresh cursor yielding record ids alongside records.
    pub fn cursor(&self) -> TableCursor<'_> {
        TableCursor::new(self)
    }

    pub(crate) fn read_data_page(&self, page_num: u32) -> Result<Page> {
        self.store.read_page(PageId::new(self.file_id, page_num))
    }
}

impl Drop for HeapTable {
    fn drop(&mut self) {
        if self.temporary {
            let _ = self.store.delete_file(self.file_id);
        }
    }
}

impl std::fmt::Debug for HeapTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapTable")
            .field("name", &self.name)
            .field("file_id", &self.file_id)
            .field("schema", &self.schema)
            .field("num_records", &self.num_records())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryPageStore;
    use strata_common::DataType;

    fn schema() -> Schema {
        Schema::new([
            ("id", DataType::Int),
            ("flag", DataType::Bool),
            ("name", DataType::String(10)),
        ])
    }

    fn row(id: i32) -> Vec<DataBox> {
        vec![
            DataBox::Int(id),
            DataBox::Bool(id % 2 == 0),
            DataBox::string(format!("row{}", id), 10),
        ]
    }

    fn new_table() -> (Arc<MemoryPageStore>, HeapTable) {
        let store = Arc::new(MemoryPageStore::new());
        let table = HeapTable::create(store.clone(), 1, "t", schema()).unwrap();
        (store, table)
    }

    #[test]
    fn test_create_writes_header() {
        let (store, table) = new_table();
        assert_eq!(store.num_pages(1).unwrap(), 1);
        assert_eq!(table.num_data_pages(), 0);
        assert_eq!(table.num_records(), 0);

        let header = store.read_page(PageId::new(1, 0)).unwrap();
        assert_eq!(Schema::read_header(&header).unwrap(), schema());
    }

    #[test]
    fn test_create_rejects_existing_file() {
        let (store, _table) = new_table();
        let result = HeapTable::create(store, 1, "again", schema());
        assert!(matches!(result, Err(StrataError::TableAlreadyExists(_))));
    }

    #[test]
    fn test_create_rejects_empty_and_oversized_schemas() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let empty = Schema::new(Vec::<(String, DataType)>::new());
        assert!(HeapTable::create(store.clone(), 1, "e", empty).is_err());

        let huge = Schema::new([("s", DataType::String(5000))]);
        assert!(matches!(
            HeapTable::create(store, 2, "h", huge),
            Err(StrataError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn test_add_and_get() {
        let (_store, table) = new_table();
        let rid = table.add_record(row(7)).unwrap();
        assert_eq!(rid, RecordId::new(1, 0));
        assert_eq!(table.get_record(rid).unwrap(), Record::new(row(7)));
        assert_eq!(table.num_records(), 1);
    }

    #[test]
    fn test_add_rejects_bad_values() {
        let (_store, table) = new_table();
        let result = table.add_record(vec![DataBox::Int(1)]);
        assert!(matches!(result, Err(StrataError::SchemaMismatch(_))));
        assert_eq!(table.num_records(), 0);
        assert_eq!(table.num_data_pages(), 0);
    }

    #[test]
    fn test_invalid_record_ids() {
        let (_store, table) = new_table();
        table.add_record(row(1)).unwrap();

        for rid in [
            RecordId::new(0, 0),
            RecordId::new(2, 0),
            RecordId::new(1, table.num_entries_per_page() as u32),
            RecordId::new(1, 1),
        ] {
            assert!(
                matches!(
                    table.get_record(rid),
                    Err(StrataError::InvalidRecordId { .. })
                ),
                "{} should be invalid",
                rid
            );
        }
    }

    #[test]
    fn test_delete_then_reuse_slot() {
        let (_store, table) = new_table();
        let first = table.add_record(row(1)).unwrap();
        let second = table.add_record(row(2)).unwrap();
        assert_eq!(first, RecordId::new(1, 0));
        assert_eq!(second, RecordId::new(1, 1));

        let deleted = table.delete_record(first).unwrap();
        assert_eq!(deleted, Record::new(row(1)));
        assert!(matches!(
            table.get_record(first),
            Err(StrataError::InvalidRecordId { .. })
        ));
        assert!(table.delete_record(first).is_err());

        assert_eq!(table.add_record(row(3)).unwrap(), RecordId::new(1, 0));
        assert_eq!(table.num_records(), 2);
    }

    #[test]
    fn test_fills_page_before_allocating() {
        let (_store, table) = new_table();
        let per_page = table.num_entries_per_page();
        for i in 0..per_page {
            table.add_record(row(i as i32)).unwrap();
        }
        assert_eq!(table.num_data_pages(), 1);

        let rid = table.add_record(row(-1)).unwrap();
        assert_eq!(rid, RecordId::new(2, 0));
        assert_eq!(table.num_data_pages(), 2);
    }

    #[test]
    fn test_reuses_full_page_after_delete() {
        let (_store, table) = new_table();
        let per_page = table.num_entries_per_page();
        let rids: Vec<RecordId> = (0..per_page + 1)
            .map(|i| table.add_record(row(i as i32)).unwrap())
            .collect();

        table.delete_record(rids[10]).unwrap();
        assert_eq!(table.add_record(row(99)).unwrap(), RecordId::new(1, 10));
        assert_eq!(table.num_data_pages(), 2);
    }

    #[test]
    fn test_update_in_place() {
        let (_store, table) = new_table();
        let rid = table.add_record(row(1)).unwrap();
        let old = table.update_record(row(50), rid).unwrap();
        assert_eq!(old, Record::new(row(1)));
        assert_eq!(table.get_record(rid).unwrap(), Record::new(row(50)));
        assert_eq!(table.num_records(), 1);

        assert!(table.update_record(vec![DataBox::Bool(true)], rid).is_err());
        assert!(table
            .update_record(row(2), RecordId::new(1, 5))
            .is_err());
    }

    #[test]
    fn test_records_in_page() {
        let (_store, table) = new_table();
        for i in 0..5 {
            table.add_record(row(i)).unwrap();
        }
        table.delete_record(RecordId::new(1, 2)).unwrap();

        let page = table.fetch_page(1).unwrap();
        let records = table.records_in_page(&page).unwrap();
        let ids: Vec<i32> = records
            .iter()
            .map(|r| r.value(0).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);

        assert!(table.fetch_page(0).is_err());
        assert!(table.fetch_page(2).is_err());
    }

    #[test]
    fn test_open_rebuilds_state() {
        let (store, table) = new_table();
        let per_page = table.num_entries_per_page();
        let rids: Vec<RecordId> = (0..per_page * 2)
            .map(|i| table.add_record(row(i as i32)).unwrap())
            .collect();
        table.delete_record(rids[per_page + 3]).unwrap();
        drop(table);

        let reopened = HeapTable::open(store, 1, "t").unwrap();
        assert_eq!(reopened.schema(), &schema());
        assert_eq!(reopened.num_records(), per_page * 2 - 1);
        assert_eq!(reopened.num_data_pages(), 2);
        assert_eq!(
            reopened.add_record(row(0)).unwrap(),
            RecordId::new(2, 3)
        );
    }

    #[test]
    fn test_open_missing_table() {
        let store = Arc::new(MemoryPageStore::new());
        assert!(matches!(
            HeapTable::open(store, 9, "missing"),
            Err(StrataError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_temporary_table_releases_file() {
        let store = Arc::new(MemoryPageStore::new());
        let table = HeapTable::create_temporary(store.clone(), 4, "tmp", schema()).unwrap();
        table.add_record(row(1)).unwrap();
        assert_eq!(store.num_pages(4).unwrap(), 2);

        drop(table);
        assert_eq!(store.num_pages(4).unwrap(), 0);
    }
}

//! Forward iteration over the live records of a heap table.

use super::constants::FIRST_DATA_PAGE;
use super::table::HeapTable;
use crate::record::{Record, RecordId};
use std::ops::Deref;
use std::sync::Arc;
use strata_common::page::Page;
use strata_common::Result;

/// Table a cursor reads from: borrowed for scans tied to a caller's
/// lifetime, shared when the cursor must outlive the borrow.
enum TableRef<'a> {
    Borrowed(&'a HeapTable),
    Shared(Arc<HeapTable>),
}

impl Deref for TableRef<'_> {
    type Target = HeapTable;

    fn deref(&self) -> &HeapTable {
        match self {
            TableRef::Borrowed(table) => table,
            TableRef::Shared(table) => table.as_ref(),
        }
    }
}

/// Cursor over live records in (page, slot) order.
///
/// Holds at most one data page in memory. A cursor is not safe to use while
/// the table is being modified; records added or removed mid-scan may or may
/// not be observed.
pub struct TableCursor<'a> {
    table: TableRef<'a>,
    /// Page the next record is searched on.
    page_num: u32,
    /// First slot to examine on `page_num`.
    slot: usize,
    /// Cached copy of `page_num`, loaded on demand.
    page: Option<Page>,
    /// Set after an error so the cursor stops.
    failed: bool,
}

impl<'a> TableCursor<'a> {
    pub(crate) fn new(table: &'a HeapTable) -> Self {
        Self::with_table(TableRef::Borrowed(table))
    }

    fn with_table(table: TableRef<'a>) -> Self {
        Self {
            table,
            page_num: FIRST_DATA_PAGE,
            slot: 0,
            page: None,
            failed: false,
        }
    }

    /// Cursor that keeps `table` alive for as long as it is used.
    pub fn shared(table: Arc<HeapTable>) -> TableCursor<'static> {
        TableCursor::with_table(TableRef::Shared(table))
    }

    /// Repositions the cursor so the next record returned is the first live
    /// record at or after `rid`.
    pub fn seek(&mut self, rid: RecordId) {
        if self.page_num != rid.page_num {
            self.page = None;
        }
        self.page_num = rid.page_num.max(FIRST_DATA_PAGE);
        self.slot = rid.slot as usize;
        self.failed = false;
    }

    fn advance(&mut self) -> Result<Option<(RecordId, Record)>> {
        let layout = *self.table.layout();
        loop {
            if !self.table.data_page_numbers().contains(&self.page_num) {
                return Ok(None);
            }
            if self.page.is_none() {
                self.page = Some(self.table.read_data_page(self.page_num)?);
            }
            let found = self
                .page
                .as_ref()
                .and_then(|page| layout.next_live_slot(page, self.slot).map(|s| (page, s)));

            match found {
                Some((page, slot)) => {
                    let record = self.table.schema().decode(layout.read_slot(page, slot))?;
                    let rid = RecordId::new(self.page_num, slot as u32);
                    self.slot = slot + 1;
                    return Ok(Some((rid, record)));
                }
                None => {
                    self.page = None;
                    self.page_num += 1;
                    self.slot = 0;
                }
            }
        }
    }
}

impl Iterator for TableCursor<'_> {
    type Item = Result<(RecordId, Record)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the live records of a table.
pub struct TableIter<'a> {
    cursor: TableCursor<'a>,
}

impl<'a> TableIter<'a> {
    pub(crate) fn new(table: &'a HeapTable) -> Self {
        Self {
            cursor: TableCursor::new(table),
        }
    }
}

impl Iterator for TableIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor
            .next()
            .map(|item| item.map(|(_, record)| record))
    }
}

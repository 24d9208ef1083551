//! Heap table storage.
//!
//! This module provides fixed-width record storage with:
//! - PageLayout: slot bitmap and slot geometry of a data page
//! - HeapTable: insert, delete, update, and lookup by record id
//! - TableIter / TableCursor: forward scans in (page, slot) order

pub mod constants;
mod page;
mod scan;
mod table;

pub use page::PageLayout;
pub use scan::{TableCursor, TableIter};
pub use table::HeapTable;

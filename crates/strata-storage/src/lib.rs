//! Storage engine for Strata.
//!
//! This crate provides:
//! - Page stores for page-level I/O (on disk and in memory)
//! - Schemas and the fixed-width record codec
//! - Heap tables with slot-bitmap data pages
//! - B+ tree secondary indexes

mod btree;
mod disk;
mod heap;
mod record;
mod schema;
mod store;

pub use btree::{
    max_order, BPlusTree, BTreeScan, InnerEntry, InnerNode, LeafEntry, LeafNode, Node,
};
pub use disk::{DiskManager, DiskManagerConfig, PageStore};
pub use heap::{HeapTable, PageLayout, TableCursor, TableIter};
pub use record::{Record, RecordId};
pub use schema::Schema;
pub use store::MemoryPageStore;

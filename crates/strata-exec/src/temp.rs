//! Scratch space for temporary heap tables.

use log::trace;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use strata_common::Result;
use strata_storage::{HeapTable, MemoryPageStore, PageStore, Schema};

/// Allocates temporary heap tables in memory.
///
/// Every table gets a fresh file id. A table's pages are released when its
/// last handle is dropped.
pub struct TempSpace {
    store: Arc<MemoryPageStore>,
    next_file_id: AtomicU32,
}

impl TempSpace {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryPageStore::new()),
            next_file_id: AtomicU32::new(1),
        }
    }

    /// Creates an empty temporary table named `{prefix}_{file_id}`.
    pub fn create_table(&self, prefix: &str, schema: Schema) -> Result<Arc<HeapTable>> {
        let file_id = self.next_file_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}", prefix, file_id);
        trace!("Creating temporary table {}", name);
        let store: Arc<dyn PageStore> = self.store.clone();
        Ok(Arc::new(HeapTable::create_temporary(
            store, file_id, name, schema,
        )?))
    }

    /// Pages currently held by live temporary tables.
    pub fn pages_in_use(&self) -> usize {
        self.store.total_pages()
    }
}

impl Default for TempSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{DataBox, DataType};

    fn schema() -> Schema {
        Schema::new([("v", DataType::Int)])
    }

    #[test]
    fn test_tables_get_distinct_files() {
        let temp = TempSpace::new();
        let a = temp.create_table("run", schema()).unwrap();
        let b = temp.create_table("run", schema()).unwrap();
        assert_ne!(a.file_id(), b.file_id());
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("run_"));
    }

    #[test]
    fn test_dropping_table_releases_pages() {
        let temp = TempSpace::new();
        let table = temp.create_table("scratch", schema()).unwrap();
        for i in 0..5000 {
            table.add_record(vec![DataBox::Int(i)]).unwrap();
        }
        assert!(temp.pages_in_use() > 1);

        let other = Arc::clone(&table);
        drop(table);
        assert!(temp.pages_in_use() > 1);
        drop(other);
        assert_eq!(temp.pages_in_use(), 0);
    }
}

//! Pull-based query operators.
//!
//! An operator describes a relation: its output schema and a way to iterate
//! its records. Iteration is lazy; records are produced one at a time as the
//! consumer pulls them.

use std::sync::Arc;
use strata_common::Result;
use strata_storage::{HeapTable, Record, Schema};

/// Boxed iterator over an operator's output records.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<Record>> + 'a>;

/// A node in an operator tree.
pub trait QueryOperator {
    /// Schema of every record this operator produces.
    fn output_schema(&self) -> &Schema;

    /// Starts a new pass over the operator's output.
    fn iter(&self) -> Result<RecordIter<'_>>;

    /// The heap table this operator reads unchanged, if any.
    ///
    /// Joins read base tables page by page in place. Any other source is
    /// copied into a temporary table first.
    fn base_table(&self) -> Option<Arc<HeapTable>> {
        None
    }
}

/// Full scan of a heap table in (page, slot) order.
pub struct SequentialScanOperator {
    table: Arc<HeapTable>,
    schema: Schema,
}

impl SequentialScanOperator {
    /// Scans `table`. Output fields are qualified with the table name.
    pub fn new(table: Arc<HeapTable>) -> Self {
        let schema = table.schema().qualified(table.name());
        Self { table, schema }
    }

    /// The scanned table.
    pub fn table(&self) -> &Arc<HeapTable> {
        &self.table
    }
}

impl QueryOperator for SequentialScanOperator {
    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        Ok(Box::new(self.table.iter()))
    }

    fn base_table(&self) -> Option<Arc<HeapTable>> {
        Some(Arc::clone(&self.table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_common::{DataBox, DataType};
    use strata_storage::MemoryPageStore;

    fn table() -> Arc<HeapTable> {
        let store = Arc::new(MemoryPageStore::new());
        let schema = Schema::new([("id", DataType::Int), ("tag", DataType::String(4))]);
        let table = HeapTable::create(store, 1, "items", schema).unwrap();
        for i in 0..10 {
            table
                .add_record(vec![DataBox::Int(i), DataBox::string("t", 4)])
                .unwrap();
        }
        Arc::new(table)
    }

    #[test]
    fn test_sequential_scan_schema_is_qualified() {
        let scan = SequentialScanOperator::new(table());
        assert_eq!(scan.output_schema().field_names(), ["items.id", "items.tag"]);
        assert_eq!(scan.output_schema().field_index("id"), Some(0));
    }

    #[test]
    fn test_sequential_scan_yields_all_records() {
        let scan = SequentialScanOperator::new(table());
        let ids: Vec<i32> = scan
            .iter()
            .unwrap()
            .map(|r| r.unwrap().value(0).unwrap().as_int().unwrap())
            .collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        // A second pass starts over.
        assert_eq!(scan.iter().unwrap().count(), 10);
    }

    #[test]
    fn test_sequential_scan_is_a_base_table() {
        let scan = SequentialScanOperator::new(table());
        let base = scan.base_table().unwrap();
        assert!(Arc::ptr_eq(&base, scan.table()));
    }
}

//! External equi-join operators.
//!
//! Every join reads two sources, compares one column from each and emits
//! the left record's fields followed by the right record's fields for each
//! pair whose values are equal. Sources that are not base tables are first
//! copied into temporary heap tables so each algorithm can work on pages.
//!
//! The algorithms differ only in how they use the buffer budget `B`, the
//! number of page-sized buffers they may hold at once:
//!
//! - [`PageNestedLoopJoin`]: one left page against every right page.
//! - [`BlockNestedLoopJoin`]: `B - 2` left pages against every right page.
//! - [`GraceHashJoin`]: hash partitioning into `B - 1` buckets, then an
//!   in-memory build and probe per bucket.
//! - [`SortMergeJoin`]: external sort of both sides, then a merge.

mod grace_hash;
mod nested_loop;
mod sort;
mod sort_merge;

pub use grace_hash::GraceHashJoin;
pub use nested_loop::{BlockNestedLoopJoin, PageNestedLoopJoin};
pub use sort::ExternalSort;
pub use sort_merge::SortMergeJoin;

use crate::operator::QueryOperator;
use crate::temp::TempSpace;
use log::debug;
use std::sync::Arc;
use strata_common::{DataBox, Result, StrataError, MIN_BUFFER_PAGES};
use strata_storage::{HeapTable, Record, Schema};

/// Join algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinAlgorithm {
    PageNestedLoop,
    BlockNestedLoop,
    GraceHash,
    SortMerge,
}

impl JoinAlgorithm {
    pub const ALL: [JoinAlgorithm; 4] = [
        JoinAlgorithm::PageNestedLoop,
        JoinAlgorithm::BlockNestedLoop,
        JoinAlgorithm::GraceHash,
        JoinAlgorithm::SortMerge,
    ];

    /// Builds the join operator for this algorithm.
    pub fn build(
        self,
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        buffer_pages: usize,
        temp: Arc<TempSpace>,
    ) -> Result<Box<dyn QueryOperator>> {
        let join = JoinOperator::new(left, right, left_column, right_column, buffer_pages, temp)?;
        let operator: Box<dyn QueryOperator> = match self {
            JoinAlgorithm::PageNestedLoop => Box::new(PageNestedLoopJoin::from_join(join)),
            JoinAlgorithm::BlockNestedLoop => Box::new(BlockNestedLoopJoin::from_join(join)),
            JoinAlgorithm::GraceHash => Box::new(GraceHashJoin::from_join(join)),
            JoinAlgorithm::SortMerge => Box::new(SortMergeJoin::from_join(join)),
        };
        Ok(operator)
    }
}

impl std::fmt::Display for JoinAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JoinAlgorithm::PageNestedLoop => "PNLJ",
            JoinAlgorithm::BlockNestedLoop => "BNLJ",
            JoinAlgorithm::GraceHash => "GHJ",
            JoinAlgorithm::SortMerge => "SMJ",
        };
        f.write_str(name)
    }
}

/// Which input of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Left,
    Right,
}

/// State shared by every join algorithm: the two sources, the resolved join
/// columns, the buffer budget and where temporary tables go.
pub struct JoinOperator {
    left: Box<dyn QueryOperator>,
    right: Box<dyn QueryOperator>,
    left_column: usize,
    right_column: usize,
    buffer_pages: usize,
    temp: Arc<TempSpace>,
    schema: Schema,
}

impl JoinOperator {
    /// Resolves the join columns and checks that they can be compared.
    pub fn new(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        buffer_pages: usize,
        temp: Arc<TempSpace>,
    ) -> Result<Self> {
        if buffer_pages < MIN_BUFFER_PAGES {
            return Err(StrataError::InvalidParameter {
                name: "buffer_pages".to_string(),
                value: buffer_pages.to_string(),
            });
        }
        let left_index = resolve(left.output_schema(), left_column)?;
        let right_index = resolve(right.output_schema(), right_column)?;

        let left_type = left.output_schema().field_types()[left_index];
        let right_type = right.output_schema().field_types()[right_index];
        if !left_type.is_comparable_with(&right_type) {
            return Err(StrataError::TypeMismatch {
                expected: left_type.to_string(),
                actual: right_type.to_string(),
            });
        }

        let schema = left.output_schema().concat(right.output_schema());
        Ok(Self {
            left,
            right,
            left_column: left_index,
            right_column: right_index,
            buffer_pages,
            temp,
            schema,
        })
    }

    pub fn output_schema(&self) -> &Schema {
        &self.schema
    }

    pub fn buffer_pages(&self) -> usize {
        self.buffer_pages
    }

    pub fn left_column(&self) -> usize {
        self.left_column
    }

    pub fn right_column(&self) -> usize {
        self.right_column
    }

    pub(crate) fn temp(&self) -> &TempSpace {
        &self.temp
    }

    pub(crate) fn column(&self, side: Side) -> usize {
        match side {
            Side::Left => self.left_column,
            Side::Right => self.right_column,
        }
    }

    pub(crate) fn source(&self, side: Side) -> &dyn QueryOperator {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    /// Join value of a record from `side`.
    pub(crate) fn key<'r>(&self, record: &'r Record, side: Side) -> Result<&'r DataBox> {
        let column = self.column(side);
        record.value(column).ok_or_else(|| {
            StrataError::Internal(format!(
                "record with {} values has no join column {}",
                record.len(),
                column
            ))
        })
    }

    /// Whether a left and a right record join.
    pub(crate) fn matches(&self, left: &Record, right: &Record) -> Result<bool> {
        Ok(self.key(left, Side::Left)? == self.key(right, Side::Right)?)
    }

    /// The heap table holding `side`'s records.
    ///
    /// Base tables are used in place. Other sources are drained into a new
    /// temporary table.
    pub(crate) fn materialize(&self, side: Side) -> Result<Arc<HeapTable>> {
        let source = self.source(side);
        if let Some(table) = source.base_table() {
            return Ok(table);
        }
        let table = self
            .temp()
            .create_table("materialized", source.output_schema().clone())?;
        for record in source.iter()? {
            table.add_record(record?.into_values())?;
        }
        debug!(
            "Materialized {:?} join input into {} ({} records, {} pages)",
            side,
            table.name(),
            table.num_records(),
            table.num_data_pages()
        );
        Ok(table)
    }
}

fn resolve(schema: &Schema, column: &str) -> Result<usize> {
    schema
        .field_index(column)
        .ok_or_else(|| StrataError::ColumnNotFound(column.to_string()))
}

/// Decoded records of the data pages `pages` of `table`, in order.
pub(crate) fn read_pages(
    table: &HeapTable,
    pages: std::ops::Range<u32>,
) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for page_num in pages {
        let page = table.fetch_page(page_num)?;
        records.extend(table.records_in_page(&page)?);
    }
    Ok(records)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Join inputs with one integer key and a wide payload, so a few dozen
    //! records span several pages.

    use crate::operator::{QueryOperator, SequentialScanOperator};
    use std::sync::Arc;
    use strata_common::{DataBox, DataType};
    use strata_storage::{HeapTable, MemoryPageStore, Schema};

    pub type Row = (i32, String, i32, String);

    /// Scan over a table `name(k INT, tag STRING(200))` with one record per key.
    pub fn keyed_scan(name: &str, keys: &[i32]) -> Box<dyn QueryOperator> {
        let store = Arc::new(MemoryPageStore::new());
        let schema = Schema::new([("k", DataType::Int), ("tag", DataType::String(200))]);
        let table = HeapTable::create(store, 1, name, schema).unwrap();
        for (i, key) in keys.iter().enumerate() {
            table
                .add_record(vec![
                    DataBox::Int(*key),
                    DataBox::string(format!("{}{}", name, i), 200),
                ])
                .unwrap();
        }
        Box::new(SequentialScanOperator::new(Arc::new(table)))
    }

    pub fn run_unsorted(op: &dyn QueryOperator) -> Vec<Row> {
        op.iter()
            .unwrap()
            .map(|record| {
                let record = record.unwrap();
                let v = record.values();
                (
                    v[0].as_int().unwrap(),
                    v[1].as_str().unwrap().to_string(),
                    v[2].as_int().unwrap(),
                    v[3].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    pub fn run(op: &dyn QueryOperator) -> Vec<Row> {
        let mut rows = run_unsorted(op);
        rows.sort();
        rows
    }

    /// Result of joining `keyed_scan("l", left)` with `keyed_scan("r", right)`.
    pub fn expected(left: &[i32], right: &[i32]) -> Vec<Row> {
        let mut rows = Vec::new();
        for (i, lk) in left.iter().enumerate() {
            for (j, rk) in right.iter().enumerate() {
                if lk == rk {
                    rows.push((*lk, format!("l{}", i), *rk, format!("r{}", j)));
                }
            }
        }
        rows.sort();
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::SequentialScanOperator;
    use strata_common::DataType;
    use strata_storage::MemoryPageStore;

    fn scan(name: &str, fields: Vec<(&str, DataType)>) -> Box<dyn QueryOperator> {
        let store = Arc::new(MemoryPageStore::new());
        let table = HeapTable::create(store, 1, name, Schema::new(fields)).unwrap();
        Box::new(SequentialScanOperator::new(Arc::new(table)))
    }

    fn join(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        buffer_pages: usize,
    ) -> Result<JoinOperator> {
        JoinOperator::new(
            left,
            right,
            left_column,
            right_column,
            buffer_pages,
            Arc::new(TempSpace::new()),
        )
    }

    #[test]
    fn test_output_schema_concatenates_inputs() {
        let op = join(
            scan("l", vec![("id", DataType::Int), ("a", DataType::Bool)]),
            scan("r", vec![("rid", DataType::Int)]),
            "id",
            "r.rid",
            3,
        )
        .unwrap();
        assert_eq!(op.output_schema().field_names(), ["l.id", "l.a", "r.rid"]);
        assert_eq!(op.left_column(), 0);
        assert_eq!(op.right_column(), 0);
    }

    #[test]
    fn test_missing_column() {
        let result = join(
            scan("l", vec![("id", DataType::Int)]),
            scan("r", vec![("id", DataType::Int)]),
            "id",
            "missing",
            3,
        );
        assert!(matches!(result, Err(StrataError::ColumnNotFound(c)) if c == "missing"));
    }

    #[test]
    fn test_incomparable_columns() {
        let result = join(
            scan("l", vec![("id", DataType::Int)]),
            scan("r", vec![("id", DataType::String(4))]),
            "id",
            "id",
            3,
        );
        assert!(matches!(result, Err(StrataError::TypeMismatch { .. })));
    }

    #[test]
    fn test_strings_of_different_width_are_comparable() {
        let result = join(
            scan("l", vec![("s", DataType::String(4))]),
            scan("r", vec![("s", DataType::String(12))]),
            "s",
            "s",
            3,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_buffer_budget_minimum() {
        let result = join(
            scan("l", vec![("id", DataType::Int)]),
            scan("r", vec![("id", DataType::Int)]),
            "id",
            "id",
            2,
        );
        assert!(matches!(
            result,
            Err(StrataError::InvalidParameter { name, .. }) if name == "buffer_pages"
        ));
    }

    #[test]
    fn test_algorithm_names() {
        let names: Vec<String> = JoinAlgorithm::ALL.iter().map(|a| a.to_string()).collect();
        assert_eq!(names, ["PNLJ", "BNLJ", "GHJ", "SMJ"]);
    }
}

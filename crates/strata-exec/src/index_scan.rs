//! Index-driven scans over a heap table.

use crate::operator::{QueryOperator, RecordIter};
use log::debug;
use std::cmp::Ordering;
use std::sync::Arc;
use strata_common::{DataBox, Result, StrataError};
use strata_storage::{BPlusTree, HeapTable, Record, RecordId, Schema};

type EntryIter<'a> = Box<dyn Iterator<Item = Result<(DataBox, RecordId)>> + 'a>;

/// Comparison between a column value and a constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateOperator {
    Equals,
    NotEquals,
    LessThan,
    LessThanEquals,
    GreaterThan,
    GreaterThanEquals,
}

impl PredicateOperator {
    /// Whether `value <op> constant` holds.
    pub fn evaluate(&self, value: &DataBox, constant: &DataBox) -> bool {
        let ord = value.cmp(constant);
        match self {
            PredicateOperator::Equals => ord == Ordering::Equal,
            PredicateOperator::NotEquals => ord != Ordering::Equal,
            PredicateOperator::LessThan => ord == Ordering::Less,
            PredicateOperator::LessThanEquals => ord != Ordering::Greater,
            PredicateOperator::GreaterThan => ord == Ordering::Greater,
            PredicateOperator::GreaterThanEquals => ord != Ordering::Less,
        }
    }
}

impl std::fmt::Display for PredicateOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            PredicateOperator::Equals => "=",
            PredicateOperator::NotEquals => "!=",
            PredicateOperator::LessThan => "<",
            PredicateOperator::LessThanEquals => "<=",
            PredicateOperator::GreaterThan => ">",
            PredicateOperator::GreaterThanEquals => ">=",
        };
        f.write_str(symbol)
    }
}

/// Scan of the records whose indexed column satisfies a predicate.
///
/// Records come out in key order. The index is insert-only, so an entry may
/// point at a deleted slot or at a record whose column has since changed.
/// Each fetched record is therefore checked against the entry's key and
/// stale entries are skipped.
pub struct IndexScanOperator {
    table: Arc<HeapTable>,
    index: Arc<BPlusTree>,
    column: usize,
    predicate: PredicateOperator,
    value: DataBox,
    schema: Schema,
}

impl IndexScanOperator {
    /// Scans `table` through `index`, which must be keyed on `column`.
    pub fn new(
        table: Arc<HeapTable>,
        index: Arc<BPlusTree>,
        column: &str,
        predicate: PredicateOperator,
        value: DataBox,
    ) -> Result<Self> {
        let column_index = table
            .schema()
            .field_index(column)
            .ok_or_else(|| StrataError::ColumnNotFound(column.to_string()))?;
        let column_type = table.schema().field_types()[column_index];
        if column_type != index.key_type() {
            return Err(StrataError::TypeMismatch {
                expected: column_type.to_string(),
                actual: index.key_type().to_string(),
            });
        }
        if !value.data_type().is_comparable_with(&column_type) {
            return Err(StrataError::TypeMismatch {
                expected: column_type.to_string(),
                actual: value.data_type().to_string(),
            });
        }

        let schema = table.schema().qualified(table.name());
        Ok(Self {
            table,
            index,
            column: column_index,
            predicate,
            value,
            schema,
        })
    }

    pub fn predicate(&self) -> PredicateOperator {
        self.predicate
    }

    /// Index entries that may satisfy the predicate, in key order.
    fn candidates(&self) -> Result<EntryIter<'_>> {
        let value = self.value.clone();
        let entries: EntryIter<'_> = match self.predicate {
            PredicateOperator::Equals => {
                let rids = self.index.lookup_key(&self.value)?;
                Box::new(
                    rids.into_iter()
                        .map(move |rid| Ok::<_, StrataError>((value.clone(), rid))),
                )
            }
            PredicateOperator::GreaterThan | PredicateOperator::GreaterThanEquals => {
                Box::new(self.index.sorted_scan_from(&self.value)?)
            }
            PredicateOperator::LessThan | PredicateOperator::LessThanEquals => {
                // Keys arrive ascending, so the scan can stop at the first key
                // past the bound.
                Box::new(self.index.sorted_scan()?.take_while(move |item| match item {
                    Ok((key, _)) => *key <= value,
                    Err(_) => true,
                }))
            }
            PredicateOperator::NotEquals => Box::new(self.index.sorted_scan()?),
        };
        Ok(entries)
    }

    /// Fetches the record behind an index entry if the entry is still current.
    fn fetch(&self, key: &DataBox, rid: RecordId) -> Result<Option<Record>> {
        let record = match self.table.get_record(rid) {
            Ok(record) => record,
            Err(StrataError::InvalidRecordId { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let current = record.value(self.column);
        if current != Some(key) || !self.predicate.evaluate(key, &self.value) {
            return Ok(None);
        }
        Ok(Some(record))
    }
}

impl QueryOperator for IndexScanOperator {
    fn output_schema(&self) -> &Schema {
        &self.schema
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        debug!(
            "Index scan on {}.{} {} {}",
            self.table.name(),
            self.table.schema().field_names()[self.column],
            self.predicate,
            self.value
        );
        let candidates = self.candidates()?;
        Ok(Box::new(candidates.filter_map(move |item| match item {
            Ok((key, rid)) => self.fetch(&key, rid).transpose(),
            Err(e) => Some(Err(e)),
        })))
    }
}

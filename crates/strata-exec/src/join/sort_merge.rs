//! Sort-merge join.

use super::{ExternalSort, JoinOperator, Side};
use crate::operator::{QueryOperator, RecordIter};
use crate::temp::TempSpace;
use log::debug;
use std::sync::Arc;
use strata_common::{DataBox, Result};
use strata_storage::{HeapTable, Record, RecordId, Schema, TableCursor};

/// Joins by sorting both inputs on the join column and merging them.
///
/// For each run of equal keys the right run is rescanned once per left
/// record of the matching left run. The rescan starts from a mark, the
/// record id of the first right record of the run, so only the sorted
/// tables' cursors are held in memory.
pub struct SortMergeJoin {
    join: JoinOperator,
}

impl SortMergeJoin {
    pub fn new(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        buffer_pages: usize,
        temp: Arc<TempSpace>,
    ) -> Result<Self> {
        let join = JoinOperator::new(
            left,
            right,
            left_column,
            right_column,
            buffer_pages,
            temp,
        )?;
        Ok(Self::from_join(join))
    }

    pub(crate) fn from_join(join: JoinOperator) -> Self {
        Self { join }
    }

    fn sorted(&self, side: Side) -> Result<Arc<HeapTable>> {
        let table = self.join.materialize(side)?;
        let sort = ExternalSort::new(
            &table,
            self.join.column(side),
            self.join.buffer_pages(),
            self.join.temp(),
        )?;
        sort.sort()
    }
}

impl QueryOperator for SortMergeJoin {
    fn output_schema(&self) -> &Schema {
        self.join.output_schema()
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        let left = self.sorted(Side::Left)?;
        let right = self.sorted(Side::Right)?;
        debug!(
            "Merging sorted inputs {} ({} records) and {} ({} records)",
            left.name(),
            left.num_records(),
            right.name(),
            right.num_records()
        );
        Ok(Box::new(SortMergeIter::new(&self.join, left, right)?))
    }
}

struct SortMergeIter<'a> {
    join: &'a JoinOperator,
    left: TableCursor<'static>,
    right: TableCursor<'static>,
    left_record: Option<Record>,
    right_record: Option<(RecordId, Record)>,
    /// First right record of the run matching the current left key.
    mark: Option<RecordId>,
    failed: bool,
}

impl<'a> SortMergeIter<'a> {
    fn new(join: &'a JoinOperator, left: Arc<HeapTable>, right: Arc<HeapTable>) -> Result<Self> {
        let mut iter = Self {
            join,
            left: TableCursor::shared(left),
            right: TableCursor::shared(right),
            left_record: None,
            right_record: None,
            mark: None,
            failed: false,
        };
        iter.advance_left()?;
        iter.advance_right()?;
        Ok(iter)
    }

    fn advance_left(&mut self) -> Result<()> {
        self.left_record = match self.left.next() {
            Some(item) => Some(item?.1),
            None => None,
        };
        Ok(())
    }

    fn advance_right(&mut self) -> Result<()> {
        self.right_record = self.right.next().transpose()?;
        Ok(())
    }

    fn left_key(&self) -> Result<Option<&DataBox>> {
        self.left_record
            .as_ref()
            .map(|record| self.join.key(record, Side::Left))
            .transpose()
    }

    fn right_key(&self) -> Result<Option<&DataBox>> {
        self.right_record
            .as_ref()
            .map(|(_, record)| self.join.key(record, Side::Right))
            .transpose()
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            let Some(left_key) = self.left_key()? else {
                return Ok(None);
            };

            let Some(mark) = self.mark else {
                // Not inside a run: step whichever side has the smaller key.
                let Some(right_key) = self.right_key()? else {
                    return Ok(None);
                };
                match left_key.cmp(right_key) {
                    std::cmp::Ordering::Less => self.advance_left()?,
                    std::cmp::Ordering::Greater => self.advance_right()?,
                    std::cmp::Ordering::Equal => {
                        self.mark = self.right_record.as_ref().map(|(rid, _)| *rid);
                    }
                }
                continue;
            };

            if self.right_key()? == Some(left_key) {
                let joined = match (&self.left_record, &self.right_record) {
                    (Some(left), Some((_, right))) => left.concat(right),
                    _ => return Ok(None),
                };
                self.advance_right()?;
                return Ok(Some(joined));
            }

            // The right run is exhausted for this left record.
            let run_key = left_key.clone();
            self.advance_left()?;
            if self.left_key()? == Some(&run_key) {
                self.right.seek(mark);
                self.advance_right()?;
            } else {
                self.mark = None;
            }
        }
    }
}

impl Iterator for SortMergeIter<'_> {
    type Item = Result<Record>;

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

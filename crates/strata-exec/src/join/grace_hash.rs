//! Grace hash join.

use super::nested_loop::NestedLoopIter;
use super::{read_pages, JoinOperator, Side};
use crate::operator::{QueryOperator, RecordIter};
use crate::temp::TempSpace;
use log::{debug, warn};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use strata_common::{DataBox, Result};
use strata_storage::{HeapTable, Record, Schema};

/// Joins by hash partitioning both inputs into `B - 1` buckets, then
/// building an in-memory table from each left bucket and probing it with the
/// matching right bucket.
///
/// A left bucket larger than the `B - 2` pages left for the build is joined
/// with its right bucket by block nested loops instead, so the result is
/// always complete.
pub struct GraceHashJoin {
    join: JoinOperator,
}

impl GraceHashJoin {
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

    /// Splits one input into `B - 1` temporary tables by join-key hash.
    fn partition(&self, side: Side) -> Result<Vec<Arc<HeapTable>>> {
        let source = self.join.source(side);
        let num_partitions = self.join.buffer_pages() - 1;
        let schema = source.output_schema().clone();
        let partitions = (0..num_partitions)
            .map(|_| self.join.temp().create_table("partition", schema.clone()))
            .collect::<Result<Vec<_>>>()?;

        let table = self.join.materialize(side)?;
        for record in table.iter() {
            let record = record?;
            let bucket = partition_of(self.join.key(&record, side)?, num_partitions);
            partitions[bucket].add_record(record.into_values())?;
        }
        debug!(
            "Partitioned {:?} input {} into {} buckets, pages per bucket {:?}",
            side,
            table.name(),
            num_partitions,
            partitions
                .iter()
                .map(|p| p.num_data_pages())
                .collect::<Vec<_>>()
        );
        Ok(partitions)
    }
}

impl QueryOperator for GraceHashJoin {
    fn output_schema(&self) -> &Schema {
        self.join.output_schema()
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        let left = self.partition(Side::Left)?;
        let right = self.partition(Side::Right)?;
        Ok(Box::new(GraceHashIter {
            join: &self.join,
            partitions: left.into_iter().zip(right).collect(),
            next_partition: 0,
            current: None,
            failed: false,
        }))
    }
}

/// Bucket of a join value.
fn partition_of(key: &DataBox, num_partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_partitions as u64) as usize
}

/// In-memory hash table over one left bucket.
///
/// Built for a single bucket and dropped before the next one is read.
struct PartitionContext {
    table: HashMap<DataBox, Vec<Record>>,
}

impl PartitionContext {
    fn build(join: &JoinOperator, left: &HeapTable) -> Result<Self> {
        let mut table: HashMap<DataBox, Vec<Record>> = HashMap::new();
        for record in read_pages(left, left.data_page_numbers())? {
            let key = join.key(&record, Side::Left)?.clone();
            table.entry(key).or_default().push(record);
        }
        Ok(Self { table })
    }

    fn matches(&self, key: &DataBox) -> &[Record] {
        self.table.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Streams one right bucket, one page at a time, against a built context.
struct Probe {
    context: PartitionContext,
    right: Arc<HeapTable>,
    next_page: u32,
    end_page: u32,
    page_records: Vec<Record>,
    record_pos: usize,
    /// Next left match to pair with `page_records[record_pos]`.
    match_pos: usize,
}

impl Probe {
    fn new(context: PartitionContext, right: Arc<HeapTable>) -> Self {
        let pages = right.data_page_numbers();
        Self {
            context,
            right,
            next_page: pages.start,
            end_page: pages.end,
            page_records: Vec::new(),
            record_pos: 0,
            match_pos: 0,
        }
    }

    fn advance(&mut self, join: &JoinOperator) -> Result<Option<Record>> {
        loop {
            if let Some(right) = self.page_records.get(self.record_pos) {
                let lefts = self.context.matches(join.key(right, Side::Right)?);
                if let Some(left) = lefts.get(self.match_pos) {
                    self.match_pos += 1;
                    return Ok(Some(left.concat(right)));
                }
                self.record_pos += 1;
                self.match_pos = 0;
                continue;
            }
            if self.next_page >= self.end_page {
                return Ok(None);
            }
            let page = self.next_page;
            self.page_records = read_pages(&self.right, page..page + 1)?;
            self.next_page += 1;
            self.record_pos = 0;
            self.match_pos = 0;
        }
    }
}

/// How the current bucket pair is being joined.
enum PartitionState<'a> {
    Probe(Probe),
    NestedLoop(NestedLoopIter<'a>),
}

struct GraceHashIter<'a> {
    join: &'a JoinOperator,
    partitions: Vec<(Arc<HeapTable>, Arc<HeapTable>)>,
    next_partition: usize,
    current: Option<PartitionState<'a>>,
    failed: bool,
}

impl<'a> GraceHashIter<'a> {
    /// Prepares the next non-empty bucket pair, or returns false when none
    /// is left.
    fn open_next_partition(&mut self) -> Result<bool> {
        // The previous bucket's context goes before the next one is built.
        self.current = None;
        let build_pages = (self.join.buffer_pages() - 2) as u32;
        while self.next_partition < self.partitions.len() {
            let index = self.next_partition;
            self.next_partition += 1;
            let (left, right) = &self.partitions[index];
            if left.num_records() == 0 || right.num_records() == 0 {
                continue;
            }

            let left = Arc::clone(left);
            let right = Arc::clone(right);
            if left.num_data_pages() > build_pages {
                warn!(
                    "Grace hash bucket {} has {} left pages, more than the {} available; \
                     joining it with block nested loops",
                    index,
                    left.num_data_pages(),
                    build_pages
                );
                self.current = Some(PartitionState::NestedLoop(NestedLoopIter::new(
                    self.join,
                    left,
                    right,
                    build_pages as usize,
                )));
            } else {
                let context = PartitionContext::build(self.join, &left)?;
                self.current = Some(PartitionState::Probe(Probe::new(context, right)));
            }
            return Ok(true);
        }
        Ok(false)
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            let produced = match &mut self.current {
                Some(PartitionState::Probe(probe)) => probe.advance(self.join)?,
                Some(PartitionState::NestedLoop(iter)) => iter.next().transpose()?,
                None => None,
            };
            if produced.is_some() {
                return Ok(produced);
            }
            if !self.open_next_partition()? {
                return Ok(None);
            }
        }
    }
}

impl Iterator for GraceHashIter<'_> {
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

//! Page and block nested-loop joins.

use super::{read_pages, JoinOperator, Side};
use crate::operator::{QueryOperator, RecordIter};
use crate::temp::TempSpace;
use log::debug;
use std::sync::Arc;
use strata_common::{Result, MIN_BUFFER_PAGES};
use strata_storage::{HeapTable, Record, Schema};

/// Nested-loop join holding one left page at a time.
///
/// Every right page is read once per left page.
pub struct PageNestedLoopJoin {
    join: JoinOperator,
}

impl PageNestedLoopJoin {
    /// Joins with the fixed budget of one left, one right and one output page.
    pub fn new(
        left: Box<dyn QueryOperator>,
        right: Box<dyn QueryOperator>,
        left_column: &str,
        right_column: &str,
        temp: Arc<TempSpace>,
    ) -> Result<Self> {
        let join = JoinOperator::new(
            left,
            right,
            left_column,
            right_column,
            MIN_BUFFER_PAGES,
            temp,
        )?;
        Ok(Self::from_join(join))
    }

    /// Uses one left page per pass whatever budget `join` carries.
    pub(crate) fn from_join(join: JoinOperator) -> Self {
        Self { join }
    }
}

impl QueryOperator for PageNestedLoopJoin {
    fn output_schema(&self) -> &Schema {
        self.join.output_schema()
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        let left = self.join.materialize(Side::Left)?;
        let right = self.join.materialize(Side::Right)?;
        Ok(Box::new(NestedLoopIter::new(&self.join, left, right, 1)))
    }
}

/// Nested-loop join holding `B - 2` left pages at a time.
///
/// Every right page is read once per block of left pages.
pub struct BlockNestedLoopJoin {
    join: JoinOperator,
}

impl BlockNestedLoopJoin {
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
}

impl QueryOperator for BlockNestedLoopJoin {
    fn output_schema(&self) -> &Schema {
        self.join.output_schema()
    }

    fn iter(&self) -> Result<RecordIter<'_>> {
        let left = self.join.materialize(Side::Left)?;
        let right = self.join.materialize(Side::Right)?;
        let block_pages = self.join.buffer_pages() - 2;
        Ok(Box::new(NestedLoopIter::new(
            &self.join,
            left,
            right,
            block_pages,
        )))
    }
}

/// Pull-based nested-loop state machine.
///
/// For each block of left pages, every right page is loaded in turn and
/// every left record of the block is compared with every record of that
/// right page. Memory holds the block plus one right page.
pub(crate) struct NestedLoopIter<'a> {
    join: &'a JoinOperator,
    left: Arc<HeapTable>,
    right: Arc<HeapTable>,
    block_pages: u32,
    /// First left page not yet loaded into a block.
    next_left_page: u32,
    left_end: u32,
    /// Next right page to load for the current block.
    next_right_page: u32,
    right_start: u32,
    right_end: u32,
    block: Vec<Record>,
    right_records: Vec<Record>,
    /// Position of the current left record in `block`.
    left_pos: usize,
    /// Next right record to compare with `block[left_pos]`.
    right_pos: usize,
    failed: bool,
}

impl<'a> NestedLoopIter<'a> {
    pub(crate) fn new(
        join: &'a JoinOperator,
        left: Arc<HeapTable>,
        right: Arc<HeapTable>,
        block_pages: usize,
    ) -> Self {
        let left_pages = left.data_page_numbers();
        let right_pages = right.data_page_numbers();
        debug!(
            "Nested-loop join of {} ({} pages) with {} ({} pages), {} left pages per block",
            left.name(),
            left_pages.len(),
            right.name(),
            right_pages.len(),
            block_pages
        );
        Self {
            join,
            left,
            right,
            block_pages: block_pages.max(1) as u32,
            next_left_page: left_pages.start,
            left_end: left_pages.end,
            next_right_page: right_pages.end,
            right_start: right_pages.start,
            right_end: right_pages.end,
            block: Vec::new(),
            right_records: Vec::new(),
            left_pos: 0,
            right_pos: 0,
            failed: false,
        }
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            // Compare the current left record with the rest of the right page.
            if let Some(left) = self.block.get(self.left_pos) {
                while let Some(right) = self.right_records.get(self.right_pos) {
                    self.right_pos += 1;
                    if self.join.matches(left, right)? {
                        return Ok(Some(left.concat(right)));
                    }
                }
            }

            // Next left record of the block against the same right page.
            if self.left_pos + 1 < self.block.len() && !self.right_records.is_empty() {
                self.left_pos += 1;
                self.right_pos = 0;
                continue;
            }

            // Next right page for the current block.
            if self.next_right_page < self.right_end {
                let page = self.next_right_page;
                self.right_records = read_pages(&self.right, page..page + 1)?;
                self.next_right_page += 1;
                self.left_pos = 0;
                self.right_pos = 0;
                continue;
            }

            // Right side exhausted for this block: load the next block.
            if self.next_left_page < self.left_end {
                let start = self.next_left_page;
                let end = start.saturating_add(self.block_pages).min(self.left_end);
                self.block = read_pages(&self.left, start..end)?;
                self.next_left_page = end;
                self.next_right_page = self.right_start;
                self.right_records.clear();
                self.left_pos = 0;
                self.right_pos = 0;
                continue;
            }

            return Ok(None);
        }
    }
}

impl Iterator for NestedLoopIter<'_> {
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

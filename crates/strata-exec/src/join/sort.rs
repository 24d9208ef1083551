//! External merge sort of a heap table on one column.

use super::read_pages;
use crate::temp::TempSpace;
use log::{debug, trace};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use strata_common::{DataBox, Result, StrataError, MIN_BUFFER_PAGES};
use strata_storage::{HeapTable, Record, TableIter};

/// Sorts a table on one column using `B` buffer pages.
///
/// Pass 0 reads `B` pages at a time, sorts them in memory and writes each
/// batch as a sorted run. Each later pass merges up to `B - 1` runs into one
/// until a single run is left. Runs are temporary tables; a run is released
/// as soon as the pass that consumed it finishes.
pub struct ExternalSort<'a> {
    table: &'a HeapTable,
    column: usize,
    buffer_pages: usize,
    temp: &'a TempSpace,
}

impl<'a> ExternalSort<'a> {
    pub fn new(
        table: &'a HeapTable,
        column: usize,
        buffer_pages: usize,
        temp: &'a TempSpace,
    ) -> Result<Self> {
        if buffer_pages < MIN_BUFFER_PAGES {
            return Err(StrataError::InvalidParameter {
                name: "buffer_pages".to_string(),
                value: buffer_pages.to_string(),
            });
        }
        if column >= table.schema().len() {
            return Err(StrataError::ColumnNotFound(format!(
                "{} (table {} has {} columns)",
                column,
                table.name(),
                table.schema().len()
            )));
        }
        Ok(Self {
            table,
            column,
            buffer_pages,
            temp,
        })
    }

    /// Runs the sort and returns a temporary table holding every record of
    /// the input in ascending column order.
    pub fn sort(&self) -> Result<Arc<HeapTable>> {
        let mut runs = self.make_runs()?;
        let mut pass = 0;
        while runs.len() > 1 {
            pass += 1;
            let merged = runs
                .chunks(self.buffer_pages - 1)
                .map(|group| self.merge_runs(group))
                .collect::<Result<Vec<_>>>()?;
            debug!(
                "Sort of {} merge pass {}: {} runs -> {}",
                self.table.name(),
                pass,
                runs.len(),
                merged.len()
            );
            runs = merged;
        }
        match runs.pop() {
            Some(run) => Ok(run),
            None => self.new_run(),
        }
    }

    /// Pass 0: sorted runs of at most `B` pages each.
    fn make_runs(&self) -> Result<Vec<Arc<HeapTable>>> {
        let pages = self.table.data_page_numbers();
        let mut runs = Vec::new();
        let mut start = pages.start;
        while start < pages.end {
            let end = start
                .saturating_add(self.buffer_pages as u32)
                .min(pages.end);
            let mut records = read_pages(self.table, start..end)?;
            records.sort_by(|a, b| self.compare(a, b));

            let run = self.new_run()?;
            for record in records {
                run.add_record(record.into_values())?;
            }
            trace!("Sort run {} holds pages {}..{}", run.name(), start, end);
            runs.push(run);
            start = end;
        }
        debug!(
            "Sort of {} on column {}: {} pages into {} runs",
            self.table.name(),
            self.column,
            pages.len(),
            runs.len()
        );
        Ok(runs)
    }

    /// Merges sorted runs into one new run.
    fn merge_runs(&self, runs: &[Arc<HeapTable>]) -> Result<Arc<HeapTable>> {
        if let [only] = runs {
            return Ok(Arc::clone(only));
        }
        let mut inputs: Vec<TableIter<'_>> = runs.iter().map(|run| run.iter()).collect();
        let mut heap = BinaryHeap::with_capacity(inputs.len());
        for (source, input) in inputs.iter_mut().enumerate() {
            if let Some(head) = self.head(input, source)? {
                heap.push(head);
            }
        }

        let output = self.new_run()?;
        while let Some(MergeHead { record, source, .. }) = heap.pop() {
            output.add_record(record.into_values())?;
            if let Some(head) = self.head(&mut inputs[source], source)? {
                heap.push(head);
            }
        }
        Ok(output)
    }

    fn head(&self, input: &mut TableIter<'_>, source: usize) -> Result<Option<MergeHead>> {
        match input.next() {
            Some(record) => {
                let record = record?;
                let key = self.key(&record)?.clone();
                Ok(Some(MergeHead {
                    key,
                    source,
                    record,
                }))
            }
            None => Ok(None),
        }
    }

    fn new_run(&self) -> Result<Arc<HeapTable>> {
        self.temp.create_table(
            &format!("{}_sorted", self.table.name()),
            self.table.schema().clone(),
        )
    }

    fn key<'r>(&self, record: &'r Record) -> Result<&'r DataBox> {
        record.value(self.column).ok_or_else(|| {
            StrataError::Internal(format!("record has no column {}", self.column))
        })
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        a.value(self.column).cmp(&b.value(self.column))
    }
}

/// Smallest unconsumed record of one run during a merge.
struct MergeHead {
    key: DataBox,
    source: usize,
    record: Record,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    /// Reversed so `BinaryHeap` pops the smallest key. Ties go to the
    /// earlier run, which keeps the merge stable.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use strata_common::DataType;
    use strata_storage::{MemoryPageStore, Schema};

    /// Table of (k INT, pad STRING(200)); 16 records fit on a page.
    fn table(keys: &[i32]) -> HeapTable {
        let store = Arc::new(MemoryPageStore::new());
        let schema = Schema::new([("k", DataType::Int), ("pad", DataType::String(200))]);
        let table = HeapTable::create(store, 1, "input", schema).unwrap();
        for (i, k) in keys.iter().enumerate() {
            table
                .add_record(vec![DataBox::Int(*k), DataBox::string(i.to_string(), 200)])
                .unwrap();
        }
        table
    }

    fn sorted_keys(table: &HeapTable) -> Vec<i32> {
        table
            .iter()
            .map(|r| r.unwrap().value(0).unwrap().as_int().unwrap())
            .collect()
    }

    #[test]
    fn test_sort_multiple_passes() {
        let mut rng = StdRng::seed_from_u64(42);
        let keys: Vec<i32> = (0..1000).map(|_| rng.gen_range(-500..500)).collect();
        let input = table(&keys);
        assert!(input.num_data_pages() > 3 * 3);

        let temp = TempSpace::new();
        let sorted = ExternalSort::new(&input, 0, 3, &temp).unwrap().sort().unwrap();

        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(sorted_keys(&sorted), expected);
        assert_eq!(sorted.num_records(), keys.len());
    }

    #[test]
    fn test_intermediate_runs_are_released() {
        let keys: Vec<i32> = (0..500).rev().collect();
        let input = table(&keys);
        let temp = TempSpace::new();
        let sorted = ExternalSort::new(&input, 0, 4, &temp).unwrap().sort().unwrap();

        // Only the final run remains.
        assert_eq!(temp.pages_in_use(), sorted.num_data_pages() as usize + 1);
        drop(sorted);
        assert_eq!(temp.pages_in_use(), 0);
    }

    #[test]
    fn test_sort_is_stable() {
        let keys: Vec<i32> = (0..200).map(|i| i % 3).collect();
        let input = table(&keys);
        let temp = TempSpace::new();
        let sorted = ExternalSort::new(&input, 0, 3, &temp).unwrap().sort().unwrap();

        let tags: Vec<(i32, usize)> = sorted
            .iter()
            .map(|r| {
                let r = r.unwrap();
                (
                    r.value(0).unwrap().as_int().unwrap(),
                    r.value(1).unwrap().as_str().unwrap().parse().unwrap(),
                )
            })
            .collect();
        assert!(tags.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_sort_empty_and_single_page() {
        let temp = TempSpace::new();
        let empty = table(&[]);
        let sorted = ExternalSort::new(&empty, 0, 3, &temp).unwrap().sort().unwrap();
        assert_eq!(sorted.num_records(), 0);

        let small = table(&[3, 1, 2]);
        let sorted = ExternalSort::new(&small, 0, 3, &temp).unwrap().sort().unwrap();
        assert_eq!(sorted_keys(&sorted), [1, 2, 3]);
    }

    #[test]
    fn test_rejects_bad_arguments() {
        let temp = TempSpace::new();
        let input = table(&[1]);
        assert!(matches!(
            ExternalSort::new(&input, 0, 2, &temp),
            Err(StrataError::InvalidParameter { .. })
        ));
        assert!(matches!(
            ExternalSort::new(&input, 5, 3, &temp),
            Err(StrataError::ColumnNotFound(_))
        ));
    }
}

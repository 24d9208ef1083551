//! Query execution for Strata.
//!
//! This crate provides:
//! - Pull-based query operators (sequential and index scans)
//! - External joins: page and block nested loops, Grace hash, sort-merge
//! - External merge sort and temporary-table scratch space
//! - The [`Database`] facade tying tables, indexes and the catalog together

mod database;
mod index_scan;
mod join;
mod operator;
mod temp;

pub use database::Database;
pub use index_scan::{IndexScanOperator, PredicateOperator};
pub use join::{
    BlockNestedLoopJoin, ExternalSort, GraceHashJoin, JoinAlgorithm, JoinOperator,
    PageNestedLoopJoin, SortMergeJoin,
};
pub use operator::{QueryOperator, RecordIter, SequentialScanOperator};
pub use temp::TempSpace;

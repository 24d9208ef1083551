//! Strata common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all Strata components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{DatabaseConfig, ExecutionConfig, StorageConfig, MIN_BUFFER_PAGES};
pub use error::{Result, StrataError};
pub use page::{Page, PageId, PAGE_SIZE};
pub use types::{DataBox, DataType};

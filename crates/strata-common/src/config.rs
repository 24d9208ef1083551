//! Configuration structures for Strata.

use crate::error::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Smallest buffer budget a join or sort can run with: one input page per
/// side plus one output page.
pub const MIN_BUFFER_PAGES: usize = 3;

/// Top-level configuration for a Strata database instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Storage layer settings.
    pub storage: StorageConfig,
    /// Query execution settings.
    pub execution: ExecutionConfig,
}

impl DatabaseConfig {
    /// Creates a configuration rooted at `data_dir` with default settings.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig {
                data_dir: data_dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Checks settings that cannot be expressed in the types alone.
    pub fn validate(&self) -> Result<()> {
        if let Some(order) = self.storage.btree_order {
            if order == 0 {
                return Err(StrataError::ConfigError(
                    "btree_order must be at least 1".to_string(),
                ));
            }
        }
        if self.execution.buffer_pages < MIN_BUFFER_PAGES {
            return Err(StrataError::InvalidParameter {
                name: "buffer_pages".to_string(),
                value: self.execution.buffer_pages.to_string(),
            });
        }
        Ok(())
    }
}

/// Storage configuration for the database engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for table, index, and catalog files.
    pub data_dir: PathBuf,
    /// Enable fsync after page writes.
    pub fsync_enabled: bool,
    /// Overrides the page-derived B+ tree order. `None` uses the largest
    /// order whose 2d entries fit in one page.
    pub btree_order: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_enabled: true,
            btree_order: None,
        }
    }
}

/// Execution configuration for query operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Number of page-sized buffers a join or sort may hold at once.
    pub buffer_pages: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { buffer_pages: 8 }
    }
}

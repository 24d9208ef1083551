//! Error types for Strata.

use thiserror::Error;

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors that can occur in Strata operations.
#[derive(Debug, Error)]
pub enum StrataError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Storage errors
    #[error("File not found: {0}")]
    FileNotFound(u32),

    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: u64 },

    #[error("Storage exhausted: {0}")]
    StorageExhausted(String),

    // Record and schema errors
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid record id: page {page_num}, slot {slot}")]
    InvalidRecordId { page_num: u32, slot: u32 },

    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    // B+ tree errors
    #[error("Corrupt node type on page {page_num}: expected {expected} node")]
    CorruptNodeType {
        page_num: u32,
        expected: &'static str,
    },

    #[error("B+ tree corrupted: {0}")]
    BTreeCorrupted(String),

    // Catalog errors
    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Table already exists: {0}")]
    TableAlreadyExists(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

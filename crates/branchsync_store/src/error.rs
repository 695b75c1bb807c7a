//! Error types for the store interface.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a record store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Write targeted a table the store does not know.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The record payload cannot be stored.
    #[error("invalid record for table {table}: {reason}")]
    InvalidRecord {
        /// Target table.
        table: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// Optimistic version check failed.
    #[error("version conflict on {table}/{key}: expected {expected}, current {current}")]
    VersionConflict {
        /// Target table.
        table: String,
        /// Record key.
        key: String,
        /// Version the caller expected.
        expected: u64,
        /// Version currently stored.
        current: u64,
    },

    /// I/O error from a persistent implementation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error from a persistent implementation.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for version conflicts, which surface to clients as
    /// a `version-conflict` rejection rather than a server fault.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

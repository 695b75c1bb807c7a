//! The store trait consumed by the sync and mutation core.

use crate::error::StoreResult;
use branchsync_protocol::RecordRef;
use serde_json::Value;

/// Outcome of saving a record.
#[derive(Debug, Clone)]
pub struct SaveOutcome {
    /// The record as persisted, including any assigned identifier.
    pub record: Value,
    /// Whether a new row was created (as opposed to updated in place).
    pub created: bool,
}

/// A table-granular record store.
///
/// The sync core treats the store as a shared, mutable, table-granular
/// resource. Rows within one table are kept in insertion order; updates
/// replace a row in place and never change its position, which is what
/// makes the insert-only delta model sound.
///
/// # Invariants
///
/// - `list_table` returns rows in insertion order
/// - `save` of an existing identity replaces in place; new identities append
/// - reads on unknown tables return empty rather than erroring (delta
///   computation is advisory); writes on unknown tables error
pub trait TableStore: Send + Sync {
    /// Returns the known table names.
    fn tables(&self) -> Vec<String>;

    /// Returns true if the store knows the table.
    fn has_table(&self, table: &str) -> bool {
        self.tables().iter().any(|t| t == table)
    }

    /// Lists all rows of a table in insertion order.
    ///
    /// Unknown tables yield an empty sequence.
    fn list_table(&self, table: &str) -> Vec<Value>;

    /// Builds the canonical reference for a row of the given table.
    ///
    /// Returns `None` when the row exposes no usable identifier.
    fn record_reference(&self, table: &str, row: &Value) -> Option<RecordRef>;

    /// Inserts or updates a record.
    ///
    /// # Errors
    ///
    /// Returns an error on unknown tables, unstorable payloads, or a
    /// failed optimistic version check (`expectedVersion` in the record
    /// against the stored row's `version`).
    fn save(&self, table: &str, record: Value) -> StoreResult<SaveOutcome>;

    /// Removes the row matching the reference.
    ///
    /// Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error on unknown tables.
    fn remove(&self, table: &str, reference: &RecordRef) -> StoreResult<bool>;
}

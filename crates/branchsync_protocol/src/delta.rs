//! Per-table delta results.

use crate::reference::RecordRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The result of computing an insert-only delta for one table.
#[derive(Debug, Clone, Default)]
pub struct DeltaOutcome {
    /// Rows appended after the client's cursor, in insertion order.
    pub rows: Vec<Value>,
    /// Total row count of the table at computation time.
    pub total: usize,
    /// Cursor derived from the table's current last row, regardless of
    /// match outcome, so the client can re-anchor even after a forced
    /// full sync.
    pub last_cursor: Option<RecordRef>,
    /// Whether the client's cursor was located in the row sequence.
    pub matched: bool,
    /// True when the cursor had candidates but the anchor row no longer
    /// exists (likely purged), forcing a full resync of this table.
    pub requires_full_sync: bool,
    /// The normalized client cursor, when one was supplied.
    pub client_cursor: Option<RecordRef>,
    /// Whether the client supplied any usable cursor at all.
    pub had_cursor: bool,
}

/// Per-table statistics reported alongside a delta response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    /// Total rows in the table.
    pub total: usize,
    /// Rows returned in the delta.
    pub returned: usize,
    /// Whether the client cursor was found.
    pub cursor_matched: bool,
}

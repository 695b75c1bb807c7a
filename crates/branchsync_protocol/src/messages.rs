//! Sync and mutation wire messages.

use crate::delta::TableStats;
use crate::guard::{Conflict, GuardContext};
use crate::reference::RecordRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The client's table selection on a sync request.
///
/// Clients send either an array of table names, a single comma-separated
/// string, or a map of table name to last-seen cursor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum TableSelector {
    /// No tables specified.
    #[default]
    None,
    /// Array of table names.
    List(Vec<String>),
    /// Single name or comma-separated names.
    Csv(String),
    /// Map of table name to raw client cursor.
    Cursors(BTreeMap<String, Value>),
}

impl TableSelector {
    /// Returns true when the client specified no tables.
    pub fn is_none(&self) -> bool {
        matches!(self, TableSelector::None)
    }

    /// Folds another selector's tables into this one.
    ///
    /// A table named by either side is selected; where both carry a
    /// cursor for the same table, the first concrete cursor wins over a
    /// bare name or a later cursor.
    pub fn merged_with(self, extra: TableSelector) -> TableSelector {
        if extra.is_none() {
            return self;
        }
        if self.is_none() {
            return extra;
        }
        let mut merged = self.into_cursor_map();
        for (table, cursor) in extra.into_cursor_map() {
            let slot = merged.entry(table).or_insert(Value::Null);
            if slot.is_null() {
                *slot = cursor;
            }
        }
        TableSelector::Cursors(merged)
    }

    fn into_cursor_map(self) -> BTreeMap<String, Value> {
        match self {
            TableSelector::None => BTreeMap::new(),
            TableSelector::List(names) => {
                names.into_iter().map(|n| (n, Value::Null)).collect()
            }
            TableSelector::Csv(csv) => csv
                .split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(|n| (n.to_string(), Value::Null))
                .collect(),
            TableSelector::Cursors(map) => map,
        }
    }
}

/// An incremental sync request.
///
/// Clients spread cursor maps over several field names (`tables`,
/// `lastTableIds`, `tableCursors`); all sources present on a request are
/// merged into one selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "SyncRequestWire")]
pub struct SyncRequest {
    /// Requested tables and optional per-table cursors.
    pub tables: TableSelector,
    /// Client snapshot marker, under any of its accepted spellings.
    pub snapshot_marker: Option<String>,
    /// Client dataset version.
    pub version: Option<u64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SyncRequestWire {
    tables: TableSelector,
    last_table_ids: TableSelector,
    table_cursors: TableSelector,
    #[serde(
        alias = "snapshot_marker",
        alias = "dayMarker",
        alias = "day_marker",
        alias = "businessDate",
        alias = "business_date",
        alias = "businessDay",
        alias = "snapshotDay"
    )]
    snapshot_marker: Option<String>,
    #[serde(alias = "clientVersion")]
    version: Option<u64>,
}

impl From<SyncRequestWire> for SyncRequest {
    fn from(wire: SyncRequestWire) -> Self {
        Self {
            tables: wire
                .tables
                .merged_with(wire.last_table_ids)
                .merged_with(wire.table_cursors),
            snapshot_marker: wire.snapshot_marker,
            version: wire.version,
        }
    }
}

/// An incremental sync response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Tenant branch id.
    pub branch_id: String,
    /// Module id within the branch.
    pub module_id: String,
    /// Server dataset version.
    pub version: u64,
    /// Server dataset last-update timestamp (ISO-8601).
    pub updated_at: String,
    /// Identifier of the responding server.
    pub server_id: String,
    /// Server's current snapshot marker.
    pub snapshot_marker: Option<String>,
    /// Whether the client must perform a full resync.
    pub requires_full_sync: bool,
    /// Tables whose client cursor could not be located.
    pub cursor_misses: Vec<String>,
    /// Stringified last-row cursor per table.
    pub last_table_ids: BTreeMap<String, Option<String>>,
    /// Structured last-row cursor per table.
    pub last_table_refs: BTreeMap<String, Option<RecordRef>>,
    /// Appended rows per table.
    pub deltas: BTreeMap<String, Vec<Value>>,
    /// Per-table statistics.
    pub stats: BTreeMap<String, TableStats>,
    /// Echo of the client's version when it sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<u64>,
    /// Echo of the client's snapshot marker when it sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_snapshot_marker: Option<String>,
}

/// A write request against one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    /// Mutation action (`save`, `delete`, ...).
    pub action: String,
    /// Target table.
    pub table: String,
    /// Record payload.
    pub record: Value,
    /// Caller expectations; absent means no guards.
    #[serde(default)]
    pub concurrency: Option<GuardContext>,
}

/// The outcome of a mutation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    /// Whether the write was applied.
    pub success: bool,
    /// The persisted record when the write succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<Value>,
    /// Whether the write created a new record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<bool>,
    /// Conflict detail when the write was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
    /// Whether the client should perform a full resync before retrying.
    #[serde(default)]
    pub requires_full_sync: bool,
}

impl MutationResponse {
    /// Creates a success response.
    pub fn applied(record: Value, created: bool) -> Self {
        Self {
            success: true,
            record: Some(record),
            created: Some(created),
            conflict: None,
            requires_full_sync: false,
        }
    }

    /// Creates a rejection response.
    pub fn rejected(conflict: Conflict, requires_full_sync: bool) -> Self {
        Self {
            success: false,
            record: None,
            created: None,
            conflict: Some(conflict),
            requires_full_sync,
        }
    }
}

/// A sequence allocation request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SequenceRequest {
    /// Target table.
    pub table: String,
    /// Sequence-bearing field.
    pub field: String,
    /// Record context for the allocation, when relevant.
    pub record: Option<Value>,
    /// Read-only projection of the next value; must not mutate state.
    pub preview: bool,
}

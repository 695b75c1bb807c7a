//! Guard contexts and conflict reporting for write requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Caller-supplied expectations attached to a write request.
///
/// The lookup hints (`record_ref`, `cursor`, `last_known_id`,
/// `last_cursor`, `lookup`) are raw cursor inputs; the guard evaluator
/// normalizes them when resolving the existing record. Transient, one per
/// request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GuardContext {
    /// The write must target an existing record.
    pub require_existing: bool,
    /// Alias for `require_existing` used by older clients.
    pub disallow_create: bool,
    /// Expected server snapshot marker.
    pub require_snapshot_marker: Option<String>,
    /// Reject the write when client and server markers differ.
    pub enforce_snapshot: bool,
    /// Expected payment/workflow state of the existing record.
    pub expected_payment_state: Option<String>,
    /// Expected last-modified time (epoch millis or timestamp string).
    pub last_updated_at: Option<Value>,
    /// Reference to the record the client last saw.
    pub record_ref: Option<Value>,
    /// Cursor hint for resolving the existing record.
    pub cursor: Option<Value>,
    /// Last id the client knew for this record.
    pub last_known_id: Option<Value>,
    /// Last cursor the client acknowledged.
    pub last_cursor: Option<Value>,
    /// Free-form lookup value.
    pub lookup: Option<Value>,
    /// Nested expectation envelope used by some clients.
    pub expected_properties: Option<ExpectedProperties>,
}

impl GuardContext {
    /// Returns true if the caller requires a pre-existing record.
    pub fn requires_existing(&self) -> bool {
        self.require_existing || self.disallow_create
    }

    /// Resolves the expected payment state from either field.
    pub fn payment_state_expectation(&self) -> Option<&str> {
        self.expected_payment_state
            .as_deref()
            .or_else(|| {
                self.expected_properties
                    .as_ref()
                    .and_then(|p| p.payment_state.as_deref())
            })
            .filter(|s| !s.trim().is_empty())
    }

    /// Resolves the expected update timestamp input from either field.
    pub fn updated_at_expectation(&self) -> Option<&Value> {
        self.last_updated_at.as_ref().or_else(|| {
            self.expected_properties
                .as_ref()
                .and_then(|p| p.updated_at.as_ref())
        })
    }
}

/// Nested expectation envelope (`expectedProperties` on the wire).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExpectedProperties {
    /// Expected payment state.
    pub payment_state: Option<String>,
    /// Expected update timestamp.
    pub updated_at: Option<Value>,
}

/// Distinguishable conflict kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictCode {
    /// Existing record required but not found.
    RecordNotFound,
    /// Snapshot marker disagreement.
    SnapshotMismatch,
    /// Payment/workflow state disagreement.
    StateMismatch,
    /// Record modified since the client last read it.
    StaleUpdate,
    /// Store-level version disagreement.
    VersionConflict,
}

impl fmt::Display for ConflictCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConflictCode::RecordNotFound => "record-not-found",
            ConflictCode::SnapshotMismatch => "snapshot-mismatch",
            ConflictCode::StateMismatch => "state-mismatch",
            ConflictCode::StaleUpdate => "stale-update",
            ConflictCode::VersionConflict => "version-conflict",
        };
        f.write_str(text)
    }
}

/// A rejected write, with enough structured detail for the client to
/// decide whether to retry after a resync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    /// The conflict kind.
    pub code: ConflictCode,
    /// Human-readable explanation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Table the write targeted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Key of the record involved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// What the caller expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// What the server holds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
}

impl Conflict {
    /// Creates a conflict with just a code and message.
    pub fn new(code: ConflictCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            table: None,
            key: None,
            expected: None,
            actual: None,
        }
    }

    /// Attaches expected/actual detail.
    pub fn with_values(
        mut self,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        self.expected = Some(expected.into());
        self.actual = Some(actual.into());
        self
    }

    /// Attaches the table name.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn conflict_code_wire_names() {
        assert_eq!(
            serde_json::to_value(ConflictCode::RecordNotFound).unwrap(),
            json!("record-not-found")
        );
        assert_eq!(ConflictCode::StaleUpdate.to_string(), "stale-update");
    }

    #[test]
    fn guard_context_deserializes_camel_case() {
        let ctx: GuardContext = serde_json::from_value(json!({
            "requireExisting": true,
            "lastUpdatedAt": 1700000000000u64,
            "expectedPaymentState": "paid"
        }))
        .unwrap();
        assert!(ctx.requires_existing());
        assert_eq!(ctx.payment_state_expectation(), Some("paid"));
        assert!(ctx.updated_at_expectation().is_some());
    }

    #[test]
    fn expected_properties_fallback() {
        let ctx: GuardContext = serde_json::from_value(json!({
            "expectedProperties": { "paymentState": "open", "updatedAt": "2026-01-01T00:00:00Z" }
        }))
        .unwrap();
        assert_eq!(ctx.payment_state_expectation(), Some("open"));
        assert!(ctx.updated_at_expectation().is_some());
    }

    #[test]
    fn blank_payment_expectation_ignored() {
        let ctx: GuardContext =
            serde_json::from_value(json!({ "expectedPaymentState": "   " })).unwrap();
        assert_eq!(ctx.payment_state_expectation(), None);
    }
}

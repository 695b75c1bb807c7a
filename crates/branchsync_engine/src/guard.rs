//! Concurrency guard evaluation for write requests.

use crate::extract::{extract_payment_state, extract_updated_at, resolve_timestamp};
use branchsync_protocol::{normalize_cursor_input, Conflict, ConflictCode, GuardContext};
use branchsync_store::TableStore;
use serde_json::Value;

/// The outcome of evaluating guards against a write.
#[derive(Debug, Clone)]
pub struct GuardOutcome {
    /// The conflict that rejected the write, if any.
    pub conflict: Option<Conflict>,
    /// Whether the client must fully resync before retrying.
    pub requires_full_sync: bool,
    /// The existing record the guards resolved, when one was found.
    pub existing: Option<Value>,
}

impl GuardOutcome {
    fn clean(existing: Option<Value>) -> Self {
        Self {
            conflict: None,
            requires_full_sync: false,
            existing,
        }
    }

    fn rejected(conflict: Conflict, requires_full_sync: bool, existing: Option<Value>) -> Self {
        Self {
            conflict: Some(conflict),
            requires_full_sync,
            existing,
        }
    }

    /// Returns true when no guard rejected the write.
    pub fn is_clean(&self) -> bool {
        self.conflict.is_none()
    }
}

/// Snapshot markers in effect while a write is evaluated.
#[derive(Debug, Clone, Default)]
pub struct MarkerContext {
    /// The server's current snapshot marker.
    pub server_marker: Option<String>,
    /// The marker the client claims to hold.
    pub client_marker: Option<String>,
}

/// Resolves a record in a table from a raw cursor-like value.
///
/// Cursor candidates are matched first; an object carrying none of the
/// cursor fields is probed against the table's own key fields instead.
/// Scans in insertion order, so the earliest row wins when identifiers
/// collide.
pub fn find_record_using_value(
    store: &dyn TableStore,
    table: &str,
    value: &Value,
) -> Option<Value> {
    let normalized = normalize_cursor_input(value);
    if normalized.has_candidates() {
        return store.list_table(table).into_iter().find(|row| {
            store
                .record_reference(table, row)
                .is_some_and(|r| r.matches(&normalized.candidates))
        });
    }
    let target = store.record_reference(table, value)?.as_string()?;
    store.list_table(table).into_iter().find(|row| {
        store
            .record_reference(table, row)
            .and_then(|r| r.as_string())
            .as_deref()
            == Some(target.as_str())
    })
}

fn resolve_existing(
    store: &dyn TableStore,
    table: &str,
    record: &Value,
    ctx: &GuardContext,
) -> Option<Value> {
    let hints = [
        Some(record),
        ctx.record_ref.as_ref(),
        ctx.cursor.as_ref(),
        ctx.last_known_id.as_ref(),
        ctx.last_cursor.as_ref(),
        ctx.lookup.as_ref(),
    ];
    hints
        .into_iter()
        .flatten()
        .find_map(|hint| find_record_using_value(store, table, hint))
}

/// Evaluates all concurrency guards for one write request.
///
/// Checks run in a fixed order so the client always sees the most
/// actionable conflict first: existence, snapshot markers, then the
/// record-level state and staleness expectations. Marker conflicts force
/// a full resync; record-level conflicts do not.
pub fn evaluate_concurrency_guards(
    store: &dyn TableStore,
    table: &str,
    record: &Value,
    ctx: &GuardContext,
    markers: &MarkerContext,
) -> GuardOutcome {
    let existing = resolve_existing(store, table, record, ctx);

    if ctx.requires_existing() && existing.is_none() {
        let key = store
            .record_reference(table, record)
            .and_then(|r| r.as_string());
        let mut conflict = Conflict::new(
            ConflictCode::RecordNotFound,
            "existing record required but not found",
        )
        .with_table(table);
        conflict.key = key;
        return GuardOutcome::rejected(conflict, true, None);
    }

    if let Some(required) = ctx
        .require_snapshot_marker
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        // An unresolved server marker cannot contradict the client's.
        if let Some(server) = markers.server_marker.as_deref() {
            if server != required {
                let conflict = Conflict::new(
                    ConflictCode::SnapshotMismatch,
                    "required snapshot marker does not match the server's",
                )
                .with_table(table)
                .with_values(required, server);
                return GuardOutcome::rejected(conflict, true, existing);
            }
        }
    }

    if ctx.enforce_snapshot {
        if let (Some(client), Some(server)) = (
            markers.client_marker.as_deref(),
            markers.server_marker.as_deref(),
        ) {
            if client != server {
                let conflict = Conflict::new(
                    ConflictCode::SnapshotMismatch,
                    "client and server snapshot markers differ",
                )
                .with_table(table)
                .with_values(client, server);
                return GuardOutcome::rejected(conflict, true, existing);
            }
        }
    }

    let Some(current) = existing else {
        // Nothing stored yet, so record-level expectations cannot fail.
        return GuardOutcome::clean(None);
    };

    if let Some(expected_state) = ctx.payment_state_expectation() {
        let actual = extract_payment_state(&current);
        if actual.as_deref() != Some(expected_state) {
            let conflict = Conflict::new(
                ConflictCode::StateMismatch,
                "record is not in the expected payment state",
            )
            .with_table(table)
            .with_values(expected_state, actual.unwrap_or_default());
            return GuardOutcome::rejected(conflict, false, Some(current));
        }
    }

    if let Some(expected_input) = ctx.updated_at_expectation() {
        if let Some(expected_ts) = resolve_timestamp(expected_input) {
            if let Some(current_ts) = extract_updated_at(&current) {
                if current_ts > expected_ts {
                    let conflict = Conflict::new(
                        ConflictCode::StaleUpdate,
                        "record was modified after the client last read it",
                    )
                    .with_table(table)
                    .with_values(expected_ts.to_string(), current_ts.to_string());
                    return GuardOutcome::rejected(conflict, false, Some(current));
                }
            }
        }
    }

    GuardOutcome::clean(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_store::MemoryStore;
    use serde_json::json;

    fn store_with_order(record: Value) -> MemoryStore {
        let store = MemoryStore::new(["order_header"]);
        store.save("order_header", record).unwrap();
        store
    }

    #[test]
    fn missing_record_rejected_when_required() {
        let store = MemoryStore::new(["order_header"]);
        let ctx = GuardContext {
            require_existing: true,
            ..GuardContext::default()
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &MarkerContext::default(),
        );
        assert_eq!(
            outcome.conflict.unwrap().code,
            ConflictCode::RecordNotFound
        );
        assert!(outcome.requires_full_sync);
    }

    #[test]
    fn missing_record_allowed_for_creates() {
        let store = MemoryStore::new(["order_header"]);
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &GuardContext::default(),
            &MarkerContext::default(),
        );
        assert!(outcome.is_clean());
        assert!(outcome.existing.is_none());
    }

    #[test]
    fn required_marker_mismatch_forces_resync() {
        let store = store_with_order(json!({ "id": "O1" }));
        let ctx = GuardContext {
            require_snapshot_marker: Some("2026-08-25".into()),
            ..GuardContext::default()
        };
        let markers = MarkerContext {
            server_marker: Some("2026-08-26".into()),
            client_marker: None,
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &markers,
        );
        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.code, ConflictCode::SnapshotMismatch);
        assert_eq!(conflict.expected.as_deref(), Some("2026-08-25"));
        assert!(outcome.requires_full_sync);
    }

    #[test]
    fn required_marker_passes_when_server_marker_unresolved() {
        let store = store_with_order(json!({ "id": "O1" }));
        let ctx = GuardContext {
            require_snapshot_marker: Some("2026-08-26".into()),
            ..GuardContext::default()
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &MarkerContext::default(),
        );
        assert!(outcome.is_clean());
        assert!(!outcome.requires_full_sync);
    }

    #[test]
    fn enforce_snapshot_compares_both_markers() {
        let store = store_with_order(json!({ "id": "O1" }));
        let ctx = GuardContext {
            enforce_snapshot: true,
            ..GuardContext::default()
        };
        let markers = MarkerContext {
            server_marker: Some("2026-08-26".into()),
            client_marker: Some("2026-08-25".into()),
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &markers,
        );
        assert_eq!(
            outcome.conflict.unwrap().code,
            ConflictCode::SnapshotMismatch
        );
        assert!(outcome.requires_full_sync);
    }

    #[test]
    fn payment_state_mismatch_is_not_full_sync() {
        let store = store_with_order(json!({ "id": "O1", "paymentState": "paid" }));
        let ctx = GuardContext {
            expected_payment_state: Some("open".into()),
            ..GuardContext::default()
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &MarkerContext::default(),
        );
        let conflict = outcome.conflict.unwrap();
        assert_eq!(conflict.code, ConflictCode::StateMismatch);
        assert_eq!(conflict.actual.as_deref(), Some("paid"));
        assert!(!outcome.requires_full_sync);
    }

    #[test]
    fn stale_update_detected() {
        let store = store_with_order(json!({ "id": "O1", "updatedAt": 2000 }));
        let ctx = GuardContext {
            last_updated_at: Some(json!(1000)),
            ..GuardContext::default()
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &MarkerContext::default(),
        );
        assert_eq!(outcome.conflict.unwrap().code, ConflictCode::StaleUpdate);
    }

    #[test]
    fn equal_timestamp_passes() {
        let store = store_with_order(json!({ "id": "O1", "updatedAt": 1000 }));
        let ctx = GuardContext {
            last_updated_at: Some(json!(1000)),
            ..GuardContext::default()
        };
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "id": "O1" }),
            &ctx,
            &MarkerContext::default(),
        );
        assert!(outcome.is_clean());
        assert!(outcome.existing.is_some());
    }

    #[test]
    fn existing_resolved_through_last_known_id() {
        let store = store_with_order(json!({ "id": "O1", "paymentState": "open" }));
        let ctx = GuardContext {
            require_existing: true,
            last_known_id: Some(json!("O1")),
            ..GuardContext::default()
        };
        // The payload itself carries no identifier.
        let outcome = evaluate_concurrency_guards(
            &store,
            "order_header",
            &json!({ "total": 12.5 }),
            &ctx,
            &MarkerContext::default(),
        );
        assert!(outcome.is_clean());
        assert_eq!(outcome.existing.unwrap()["id"], "O1");
    }

    /// Append-only fixture that, unlike [`MemoryStore`], never merges
    /// rows sharing an identifier.
    struct AppendOnlyStore {
        rows: Vec<Value>,
    }

    impl branchsync_store::TableStore for AppendOnlyStore {
        fn tables(&self) -> Vec<String> {
            vec!["order_header".into()]
        }

        fn list_table(&self, _table: &str) -> Vec<Value> {
            self.rows.clone()
        }

        fn record_reference(
            &self,
            _table: &str,
            row: &Value,
        ) -> Option<branchsync_protocol::RecordRef> {
            let id = row.get("id")?.as_str()?;
            Some(branchsync_protocol::RecordRef::from_id(id))
        }

        fn save(
            &self,
            table: &str,
            _record: Value,
        ) -> branchsync_store::StoreResult<branchsync_store::SaveOutcome> {
            Err(branchsync_store::StoreError::UnknownTable(table.into()))
        }

        fn remove(
            &self,
            _table: &str,
            _reference: &branchsync_protocol::RecordRef,
        ) -> branchsync_store::StoreResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn duplicate_identifiers_resolve_to_earliest_row() {
        let store = AppendOnlyStore {
            rows: vec![
                json!({ "id": "O1", "rev": 1 }),
                json!({ "id": "O1", "rev": 2 }),
            ],
        };
        let found = find_record_using_value(&store, "order_header", &json!("O1")).unwrap();
        assert_eq!(found["rev"], 1);
    }

    #[test]
    fn find_record_by_table_key_fields() {
        let store = MemoryStore::new(["shift"]);
        store.set_primary_key("shift", ["branchId", "shiftNo"]);
        store
            .save("shift", json!({ "branchId": "b1", "shiftNo": "s9" }))
            .unwrap();
        let found =
            find_record_using_value(&store, "shift", &json!({ "branchId": "b1", "shiftNo": "s9" }))
                .unwrap();
        assert_eq!(found["shiftNo"], "s9");
    }
}

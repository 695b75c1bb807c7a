//! Sync session state and the per-request orchestrator.

use crate::delta::compute_insert_only_delta;
use crate::error::{EngineError, EngineResult};
use crate::guard::{evaluate_concurrency_guards, MarkerContext};
use branchsync_protocol::{
    MutationRequest, MutationResponse, SyncRequest, SyncResponse, TableSelector, TableStats,
};
use branchsync_store::{EventMeta, TableStore};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Static configuration of the sync orchestrator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Identifier of this server, echoed on every response.
    pub server_id: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_id: "local".into(),
        }
    }
}

impl SessionConfig {
    /// Creates a config with the given server id.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }
}

/// Mutable per (branch, module) sync state.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Tenant branch id.
    pub branch_id: String,
    /// Module id within the branch.
    pub module_id: String,
    /// Server dataset version, bumped by the event store on writes.
    pub version: u64,
    /// Last-update timestamp (ISO-8601).
    pub updated_at: String,
    /// Raw snapshot metadata recorded alongside the dataset.
    pub snapshot_meta: Option<Value>,
}

impl SessionState {
    /// Creates a fresh state for a (branch, module) pair.
    pub fn new(branch_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            module_id: module_id.into(),
            version: 0,
            updated_at: Utc::now().to_rfc3339(),
            snapshot_meta: None,
        }
    }
}

/// Registry of sync states, keyed by `branch::module`.
///
/// The registry is an explicit shared map injected into the
/// orchestrator, so tests and embedders control its lifetime.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    states: RwLock<HashMap<String, SessionState>>,
}

fn state_key(branch_id: &str, module_id: &str) -> String {
    format!("{branch_id}::{module_id}")
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for a pair, creating a fresh one if absent.
    pub fn ensure(&self, branch_id: &str, module_id: &str) -> SessionState {
        let key = state_key(branch_id, module_id);
        if let Some(state) = self.states.read().get(&key) {
            return state.clone();
        }
        let mut states = self.states.write();
        states
            .entry(key)
            .or_insert_with(|| SessionState::new(branch_id, module_id))
            .clone()
    }

    /// Replaces the state for a pair.
    pub fn upsert(&self, state: SessionState) {
        let key = state_key(&state.branch_id, &state.module_id);
        self.states.write().insert(key, state);
    }

    /// Drops the state for a pair. Returns true if one existed.
    pub fn clear(&self, branch_id: &str, module_id: &str) -> bool {
        self.states
            .write()
            .remove(&state_key(branch_id, module_id))
            .is_some()
    }
}

/// Resolves the server-side snapshot marker for a session.
///
/// Resolution order: the event store's recorded marker, then its current
/// business day, then marker-like fields in the session's snapshot
/// metadata, and finally the date part of the session's last-update
/// timestamp.
pub fn resolve_server_snapshot_marker(meta: &EventMeta, state: &SessionState) -> Option<String> {
    const META_FIELDS: [&str; 7] = [
        "snapshotMarker",
        "businessDate",
        "business_date",
        "businessDay",
        "business_day",
        "currentDay",
        "day",
    ];

    let trimmed = |s: &str| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };

    if let Some(marker) = meta.last_snapshot_marker.as_deref().and_then(trimmed) {
        return Some(marker);
    }
    if let Some(day) = meta.current_day.as_deref().and_then(trimmed) {
        return Some(day);
    }
    if let Some(obj) = state.snapshot_meta.as_ref().and_then(Value::as_object) {
        for field in META_FIELDS {
            if let Some(marker) = obj.get(field).and_then(Value::as_str).and_then(trimmed) {
                return Some(marker);
            }
        }
    }
    if state.updated_at.len() >= 10 {
        return trimmed(&state.updated_at[..10]);
    }
    None
}

/// Handles sync requests against a table store.
pub struct SessionOrchestrator<'a> {
    config: SessionConfig,
    registry: &'a SessionRegistry,
}

impl<'a> SessionOrchestrator<'a> {
    /// Creates an orchestrator over a shared registry.
    pub fn new(config: SessionConfig, registry: &'a SessionRegistry) -> Self {
        Self { config, registry }
    }

    /// Serves one incremental sync request.
    ///
    /// When the client requests no tables, every known table is returned
    /// in full and the response is flagged as a full sync. A snapshot
    /// marker differing from the server's, or older than the hard-close
    /// boundary, also forces a full sync.
    ///
    /// A forced full sync ignores client cursors: every selected table
    /// comes back whole and its `cursorMatched` stat reads false, even
    /// for cursors that would otherwise match. The client is going to
    /// replace its dataset anyway, so partial deltas would only be
    /// discarded.
    pub fn handle_sync(
        &self,
        store: &dyn TableStore,
        meta: &EventMeta,
        branch_id: &str,
        module_id: &str,
        request: &SyncRequest,
    ) -> SyncResponse {
        let state = self.registry.ensure(branch_id, module_id);
        let server_marker = resolve_server_snapshot_marker(meta, &state);

        let (selection, selection_forces_full) = normalize_selection(store, &request.tables);

        let client_marker = request
            .snapshot_marker
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let marker_forces_full = marker_requires_full_sync(
            client_marker,
            server_marker.as_deref(),
            meta.closed_boundary(),
        );
        if marker_forces_full {
            tracing::info!(
                branch_id,
                module_id,
                client_marker,
                server_marker = server_marker.as_deref(),
                "snapshot marker mismatch, forcing full sync"
            );
        }

        let mut requires_full_sync = selection_forces_full || marker_forces_full;
        let mut cursor_misses = Vec::new();
        let mut deltas = BTreeMap::new();
        let mut stats = BTreeMap::new();
        let mut last_table_ids = BTreeMap::new();
        let mut last_table_refs = BTreeMap::new();

        for (table, cursor) in selection {
            // A full sync ignores client cursors entirely.
            let effective_cursor = if requires_full_sync {
                Value::Null
            } else {
                cursor
            };
            let outcome = compute_insert_only_delta(store, &table, &effective_cursor);
            if outcome.requires_full_sync {
                requires_full_sync = true;
                cursor_misses.push(table.clone());
            }
            stats.insert(
                table.clone(),
                TableStats {
                    total: outcome.total,
                    returned: outcome.rows.len(),
                    cursor_matched: outcome.matched,
                },
            );
            last_table_ids.insert(
                table.clone(),
                outcome.last_cursor.as_ref().and_then(|r| r.as_string()),
            );
            last_table_refs.insert(table.clone(), outcome.last_cursor);
            deltas.insert(table, outcome.rows);
        }

        SyncResponse {
            branch_id: branch_id.to_string(),
            module_id: module_id.to_string(),
            version: state.version,
            updated_at: state.updated_at.clone(),
            server_id: self.config.server_id.clone(),
            snapshot_marker: server_marker,
            requires_full_sync,
            cursor_misses,
            last_table_ids,
            last_table_refs,
            deltas,
            stats,
            client_version: request.version,
            client_snapshot_marker: client_marker.map(str::to_string),
        }
    }

    /// Serves one guarded write request.
    ///
    /// Guards are evaluated against the markers this session resolves;
    /// a clean outcome applies the write to the store. Store version
    /// conflicts surface as structured `version-conflict` rejections;
    /// other store failures propagate as errors.
    pub fn handle_mutation(
        &self,
        store: &dyn TableStore,
        meta: &EventMeta,
        branch_id: &str,
        module_id: &str,
        request: &MutationRequest,
    ) -> EngineResult<MutationResponse> {
        let state = self.registry.ensure(branch_id, module_id);
        let markers = MarkerContext {
            server_marker: resolve_server_snapshot_marker(meta, &state),
            client_marker: request
                .concurrency
                .as_ref()
                .and_then(|c| c.require_snapshot_marker.clone()),
        };

        let guards = request.concurrency.clone().unwrap_or_default();
        let outcome =
            evaluate_concurrency_guards(store, &request.table, &request.record, &guards, &markers);
        if let Some(conflict) = outcome.conflict {
            tracing::warn!(
                branch_id,
                module_id,
                table = request.table,
                code = %conflict.code,
                "mutation rejected by concurrency guard"
            );
            return Ok(MutationResponse::rejected(
                conflict,
                outcome.requires_full_sync,
            ));
        }

        match store.save(&request.table, request.record.clone()) {
            Ok(saved) => Ok(MutationResponse::applied(saved.record, saved.created)),
            Err(err) => {
                let err = EngineError::from(err);
                match err.as_conflict() {
                    Some(conflict) => {
                        tracing::warn!(
                            branch_id,
                            module_id,
                            table = request.table,
                            "mutation rejected by store version check"
                        );
                        Ok(MutationResponse::rejected(conflict, false))
                    }
                    None => Err(err),
                }
            }
        }
    }
}

/// Expands a table selector into (table, cursor) pairs.
///
/// Unknown tables are skipped rather than erroring; the read path is
/// advisory. Returns the pairs and whether the selection itself forces
/// a full sync (no tables requested means the client has nothing yet).
fn normalize_selection(
    store: &dyn TableStore,
    selector: &TableSelector,
) -> (Vec<(String, Value)>, bool) {
    let known = |name: &str| store.has_table(name);
    match selector {
        TableSelector::None => {
            let all = store
                .tables()
                .into_iter()
                .map(|t| (t, Value::Null))
                .collect();
            (all, true)
        }
        TableSelector::List(names) => (
            names
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty() && known(n))
                .map(|n| (n.to_string(), Value::Null))
                .collect(),
            false,
        ),
        TableSelector::Csv(csv) => (
            csv.split(',')
                .map(str::trim)
                .filter(|n| !n.is_empty() && known(n))
                .map(|n| (n.to_string(), Value::Null))
                .collect(),
            false,
        ),
        TableSelector::Cursors(map) => (
            map.iter()
                .filter(|(table, _)| known(table))
                .map(|(table, cursor)| (table.clone(), cursor.clone()))
                .collect(),
            false,
        ),
    }
}

/// Marker comparison: any mismatch, or a client marker behind the
/// hard-close boundary, invalidates the client's dataset.
fn marker_requires_full_sync(
    client: Option<&str>,
    server: Option<&str>,
    closed_boundary: Option<&str>,
) -> bool {
    let Some(client) = client else {
        return false;
    };
    if let Some(server) = server {
        if client != server {
            return true;
        }
    }
    if let Some(boundary) = closed_boundary {
        // Date-granularity strings compare lexicographically.
        if client < boundary {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use branchsync_store::MemoryStore;
    use serde_json::json;

    fn store_with_orders(n: usize) -> MemoryStore {
        let store = MemoryStore::new(["order_header", "order_line"]);
        for i in 1..=n {
            store
                .save("order_header", json!({ "id": format!("O{i}") }))
                .unwrap();
        }
        store
    }

    fn orchestrator(registry: &SessionRegistry) -> SessionOrchestrator<'_> {
        SessionOrchestrator::new(SessionConfig::new("srv-1"), registry)
    }

    #[test]
    fn no_tables_requested_returns_everything_as_full_sync() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(3);
        let response = orchestrator(&registry).handle_sync(
            &store,
            &EventMeta::default(),
            "b1",
            "pos",
            &SyncRequest::default(),
        );
        assert!(response.requires_full_sync);
        assert_eq!(response.deltas["order_header"].len(), 3);
        assert!(response.deltas.contains_key("order_line"));
        assert_eq!(response.server_id, "srv-1");
    }

    #[test]
    fn cursor_selection_returns_delta() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(5);
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": { "order_header": { "id": "O3" } }
        }))
        .unwrap();
        let response = orchestrator(&registry).handle_sync(
            &store,
            &EventMeta::default(),
            "b1",
            "pos",
            &request,
        );
        assert!(!response.requires_full_sync);
        assert_eq!(response.deltas["order_header"].len(), 2);
        assert_eq!(
            response.last_table_ids["order_header"].as_deref(),
            Some("O5")
        );
        assert!(response.stats["order_header"].cursor_matched);
    }

    #[test]
    fn cursor_miss_flags_table_and_full_sync() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(3);
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": { "order_header": { "id": "gone" } }
        }))
        .unwrap();
        let response = orchestrator(&registry).handle_sync(
            &store,
            &EventMeta::default(),
            "b1",
            "pos",
            &request,
        );
        assert!(response.requires_full_sync);
        assert_eq!(response.cursor_misses, ["order_header"]);
        assert_eq!(response.deltas["order_header"].len(), 3);
    }

    #[test]
    fn marker_mismatch_forces_full_sync() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(4);
        let meta = EventMeta {
            last_snapshot_marker: Some("2026-08-26".into()),
            ..EventMeta::default()
        };
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": { "order_header": { "id": "O4" } },
            "snapshotMarker": "2026-08-25"
        }))
        .unwrap();
        let response =
            orchestrator(&registry).handle_sync(&store, &meta, "b1", "pos", &request);
        assert!(response.requires_full_sync);
        // Cursors are ignored under a full sync.
        assert_eq!(response.deltas["order_header"].len(), 4);
        assert!(!response.stats["order_header"].cursor_matched);
        assert_eq!(response.snapshot_marker.as_deref(), Some("2026-08-26"));
        assert_eq!(response.client_snapshot_marker.as_deref(), Some("2026-08-25"));
    }

    #[test]
    fn marker_behind_close_boundary_forces_full_sync() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(1);
        let meta = EventMeta {
            last_snapshot_marker: Some("2026-08-20".into()),
            last_closed_date: Some("2026-08-22".into()),
            ..EventMeta::default()
        };
        // Marker matches the server but predates the hard close.
        let state = SessionState::new("b1", "pos");
        registry.upsert(state);
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": ["order_header"],
            "snapshotMarker": "2026-08-20"
        }))
        .unwrap();
        let response =
            orchestrator(&registry).handle_sync(&store, &meta, "b1", "pos", &request);
        assert!(response.requires_full_sync);
    }

    #[test]
    fn matching_marker_is_incremental() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(2);
        let meta = EventMeta {
            last_snapshot_marker: Some("2026-08-26".into()),
            ..EventMeta::default()
        };
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": { "order_header": "O2" },
            "snapshotMarker": "2026-08-26"
        }))
        .unwrap();
        let response =
            orchestrator(&registry).handle_sync(&store, &meta, "b1", "pos", &request);
        assert!(!response.requires_full_sync);
        assert!(response.deltas["order_header"].is_empty());
    }

    #[test]
    fn csv_selection_splits_names() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(1);
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": "order_header, order_line"
        }))
        .unwrap();
        let response = orchestrator(&registry).handle_sync(
            &store,
            &EventMeta::default(),
            "b1",
            "pos",
            &request,
        );
        assert_eq!(response.deltas.len(), 2);
        assert!(!response.requires_full_sync);
    }

    #[test]
    fn marker_resolution_order() {
        let mut state = SessionState::new("b1", "pos");
        state.updated_at = "2026-08-26T12:00:00Z".into();

        let meta = EventMeta {
            last_snapshot_marker: Some("2026-08-24".into()),
            current_day: Some("2026-08-25".into()),
            ..EventMeta::default()
        };
        assert_eq!(
            resolve_server_snapshot_marker(&meta, &state).as_deref(),
            Some("2026-08-24")
        );

        let meta = EventMeta {
            current_day: Some("2026-08-25".into()),
            ..EventMeta::default()
        };
        assert_eq!(
            resolve_server_snapshot_marker(&meta, &state).as_deref(),
            Some("2026-08-25")
        );

        state.snapshot_meta = Some(json!({ "businessDate": "2026-08-23" }));
        assert_eq!(
            resolve_server_snapshot_marker(&EventMeta::default(), &state).as_deref(),
            Some("2026-08-23")
        );

        state.snapshot_meta = None;
        assert_eq!(
            resolve_server_snapshot_marker(&EventMeta::default(), &state).as_deref(),
            Some("2026-08-26")
        );
    }

    #[test]
    fn unknown_tables_skipped_in_selection() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(1);
        let request: SyncRequest = serde_json::from_value(json!({
            "tables": ["order_header", "no_such_table"]
        }))
        .unwrap();
        let response = orchestrator(&registry).handle_sync(
            &store,
            &EventMeta::default(),
            "b1",
            "pos",
            &request,
        );
        assert_eq!(response.deltas.len(), 1);
        assert!(response.deltas.contains_key("order_header"));
        assert!(!response.requires_full_sync);
    }

    #[test]
    fn mutation_applied_when_guards_pass() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(0);
        let request: MutationRequest = serde_json::from_value(json!({
            "action": "save",
            "table": "order_header",
            "record": { "id": "O1", "status": "open" }
        }))
        .unwrap();
        let response = orchestrator(&registry)
            .handle_mutation(&store, &EventMeta::default(), "b1", "pos", &request)
            .unwrap();
        assert!(response.success);
        assert_eq!(response.created, Some(true));
        assert_eq!(store.len("order_header"), 1);
    }

    #[test]
    fn mutation_rejected_by_guard() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(0);
        let request: MutationRequest = serde_json::from_value(json!({
            "action": "save",
            "table": "order_header",
            "record": { "id": "missing" },
            "concurrency": { "requireExisting": true }
        }))
        .unwrap();
        let response = orchestrator(&registry)
            .handle_mutation(&store, &EventMeta::default(), "b1", "pos", &request)
            .unwrap();
        assert!(!response.success);
        assert!(response.requires_full_sync);
        assert!(store.is_empty("order_header"));
    }

    #[test]
    fn mutation_version_conflict_is_structured_rejection() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(0);
        store
            .save("order_header", json!({ "id": "O1", "version": 5 }))
            .unwrap();
        let request: MutationRequest = serde_json::from_value(json!({
            "action": "save",
            "table": "order_header",
            "record": { "id": "O1", "version": 6, "expectedVersion": 3 }
        }))
        .unwrap();
        let response = orchestrator(&registry)
            .handle_mutation(&store, &EventMeta::default(), "b1", "pos", &request)
            .unwrap();
        assert!(!response.success);
        let conflict = response.conflict.unwrap();
        assert_eq!(conflict.expected.as_deref(), Some("3"));
        assert_eq!(conflict.actual.as_deref(), Some("5"));
    }

    #[test]
    fn mutation_unknown_table_is_an_error() {
        let registry = SessionRegistry::new();
        let store = store_with_orders(0);
        let request: MutationRequest = serde_json::from_value(json!({
            "action": "save",
            "table": "no_such_table",
            "record": { "id": "O1" }
        }))
        .unwrap();
        let err = orchestrator(&registry)
            .handle_mutation(&store, &EventMeta::default(), "b1", "pos", &request)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(branchsync_store::StoreError::UnknownTable(_))
        ));
    }

    #[test]
    fn registry_ensure_and_clear() {
        let registry = SessionRegistry::new();
        let state = registry.ensure("b1", "pos");
        assert_eq!(state.version, 0);

        let mut bumped = state;
        bumped.version = 7;
        registry.upsert(bumped);
        assert_eq!(registry.ensure("b1", "pos").version, 7);

        assert!(registry.clear("b1", "pos"));
        assert!(!registry.clear("b1", "pos"));
        assert_eq!(registry.ensure("b1", "pos").version, 0);
    }
}

//! The order aggregate orchestrator.
//!
//! An order arrives as one document: a header plus child lines, payments,
//! and status logs. Saving it fans out over the five order tables,
//! promotes draft ids to real sequenced ids, reconciles children against
//! what is already stored, and purges draft remnants afterwards.

use crate::error::{EngineError, EngineResult};
use crate::locks::InFlightLocks;
use crate::sequence::{
    allocate_with_retry, audit_and_repair, AllocationContext, RetryPolicy, RuleSource,
    SequenceAllocator, SequenceStatePersistence,
};
use branchsync_protocol::RecordRef;
use branchsync_store::TableStore;
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Order header table.
pub const TABLE_ORDER_HEADER: &str = "order_header";
/// Order line table.
pub const TABLE_ORDER_LINE: &str = "order_line";
/// Order payment table.
pub const TABLE_ORDER_PAYMENT: &str = "order_payment";
/// Order status log table.
pub const TABLE_ORDER_STATUS_LOG: &str = "order_status_log";
/// Order line status log table.
pub const TABLE_ORDER_LINE_STATUS_LOG: &str = "order_line_status_log";

/// Returns true when an order id is a client-side draft.
///
/// Drafts are either absent, carry the `draft-` prefix, or use the
/// offline three-part shape `<tag>-<epoch millis>-<counter>` with a
/// 13-digit-or-more timestamp and a 3-digit counter.
pub fn is_draft_order_id(id: Option<&str>) -> bool {
    let Some(id) = id.map(str::trim).filter(|s| !s.is_empty()) else {
        return true;
    };
    if id.len() >= 6 && id[..6].eq_ignore_ascii_case("draft-") {
        return true;
    }
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let tag_ok = !parts[0].is_empty() && parts[0].chars().all(|c| c.is_ascii_alphanumeric());
    let millis_ok = parts[1].len() >= 13 && parts[1].chars().all(|c| c.is_ascii_digit());
    let counter_ok = parts[2].len() == 3 && parts[2].chars().all(|c| c.is_ascii_digit());
    tag_ok && millis_ok && counter_ok
}

/// The result of a successful order save.
#[derive(Debug, Clone)]
pub struct SavedOrder {
    /// The (possibly promoted) order id.
    pub order_id: String,
    /// The persisted header.
    pub header: Value,
    /// Whether the header row was created rather than updated.
    pub created: bool,
}

/// Saves order aggregates with draft promotion, child reconciliation,
/// and in-flight deduplication.
pub struct OrderOrchestrator<R, P> {
    allocator: SequenceAllocator<R, P>,
    locks: InFlightLocks,
    retry: RetryPolicy,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn order_id_of(row: &Value) -> Option<&str> {
    row.get("orderId")
        .or_else(|| row.get("order_id"))
        .and_then(Value::as_str)
}

fn ensure_id(obj: &mut Map<String, Value>) -> String {
    if let Some(id) = obj
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return id.to_string();
    }
    let id = Uuid::new_v4().to_string();
    obj.insert("id".into(), Value::String(id.clone()));
    id
}

fn take_array(obj: &mut Map<String, Value>, field: &str) -> Vec<Value> {
    match obj.remove(field) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

impl<R: RuleSource, P: SequenceStatePersistence> OrderOrchestrator<R, P> {
    /// Creates an orchestrator over an allocator and a lock table.
    pub fn new(allocator: SequenceAllocator<R, P>, locks: InFlightLocks) -> Self {
        Self {
            allocator,
            locks,
            retry: RetryPolicy::default(),
        }
    }

    /// Overrides the collision retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Saves one order aggregate.
    ///
    /// Rejects empty aggregates before touching the store, fails fast
    /// when a save for the same order is already in flight, and rejects
    /// a resubmission at an already-stored version unless it carries
    /// more lines than what is stored (offline clients resend grown
    /// orders under the same version).
    pub fn save_order(
        &self,
        store: &dyn TableStore,
        branch_id: &str,
        order: Value,
    ) -> EngineResult<SavedOrder> {
        let mut order = unwrap_envelope(order)?;
        let obj = order
            .as_object_mut()
            .ok_or_else(|| EngineError::InvalidPayload("order must be an object".into()))?;

        // Non-object entries are dropped during reconciliation, so only
        // objects count towards the at-least-one-line requirement.
        let incoming_lines = match obj.get("lines") {
            Some(Value::Array(lines)) => lines.iter().filter(|l| l.is_object()).count(),
            _ => 0,
        };
        if incoming_lines == 0 {
            return Err(EngineError::EmptyAggregate);
        }

        let original_id = obj
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let ctx = AllocationContext::new(branch_id, TABLE_ORDER_HEADER, "id");

        if let Some(id) = original_id.as_deref() {
            self.check_duplicate_version(store, &ctx, id, obj, incoming_lines)?;
        }

        let lock_key = original_id
            .clone()
            .unwrap_or_else(|| format!("temp-{}", Uuid::new_v4()));
        let _guard = self.locks.try_acquire(lock_key)?;

        let draft_id = original_id
            .as_deref()
            .filter(|id| is_draft_order_id(Some(id)))
            .map(str::to_string);

        let order_id = if is_draft_order_id(original_id.as_deref()) {
            self.promote_draft(store, &ctx, obj)?
        } else {
            // Non-draft ids are trusted; original_id is known Some here.
            original_id.clone().unwrap_or_default()
        };

        let lines = take_array(obj, "lines");
        let payments = take_array(obj, "payments");
        let status_logs = take_array(obj, "statusLogs");

        if !obj.contains_key("updatedAt") {
            obj.insert("updatedAt".into(), json!(now_millis()));
        }

        let header_outcome = store.save(TABLE_ORDER_HEADER, Value::Object(obj.clone()))?;
        let header = header_outcome.record;

        self.reconcile_lines(store, &order_id, lines)?;
        self.reconcile_payments(store, &order_id, &header, payments)?;
        self.reconcile_status_logs(store, &order_id, status_logs)?;

        if let Some(draft) = draft_id.as_deref().filter(|d| *d != order_id) {
            purge_order_rows(store, draft)?;
        }

        tracing::info!(
            branch_id,
            order_id,
            created = header_outcome.created,
            promoted = draft_id.is_some(),
            "saved order aggregate"
        );

        Ok(SavedOrder {
            order_id,
            header,
            created: header_outcome.created,
        })
    }

    fn check_duplicate_version(
        &self,
        store: &dyn TableStore,
        ctx: &AllocationContext<'_>,
        id: &str,
        obj: &Map<String, Value>,
        incoming_lines: usize,
    ) -> EngineResult<()> {
        let Some(existing) = store
            .list_table(TABLE_ORDER_HEADER)
            .into_iter()
            .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
        else {
            return Ok(());
        };
        let stored_version = existing.get("version").and_then(Value::as_u64);
        let incoming_version = obj.get("version").and_then(Value::as_u64);
        let (Some(stored), Some(incoming)) = (stored_version, incoming_version) else {
            return Ok(());
        };
        if incoming != stored {
            return Ok(());
        }
        let stored_lines = store
            .list_table(TABLE_ORDER_LINE)
            .iter()
            .filter(|row| order_id_of(row) == Some(id))
            .count();
        if incoming_lines > stored_lines {
            // The client appended lines offline and resent under the
            // same version; accept it as progress.
            return Ok(());
        }
        // Likely a stuck client replaying; make sure the counter is
        // ahead of whatever is stored before rejecting.
        audit_and_repair(&self.allocator, store, ctx)?;
        Err(EngineError::DuplicateVersion {
            id: id.to_string(),
            version: incoming,
        })
    }

    fn promote_draft(
        &self,
        store: &dyn TableStore,
        ctx: &AllocationContext<'_>,
        obj: &mut Map<String, Value>,
    ) -> EngineResult<String> {
        let allocation = allocate_with_retry(&self.allocator, store, ctx, &self.retry)?;
        let order_id = allocation.formatted.clone();
        obj.insert("id".into(), Value::String(order_id.clone()));

        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| json!({}));
        if let Some(meta) = metadata.as_object_mut() {
            meta.insert("invoiceSequence".into(), json!(allocation.value));
            meta.insert(
                "sequenceRule".into(),
                Value::String(allocation.sequence_key.clone()),
            );
        }
        if let Some(field) = allocation.rule.counter_field.as_deref() {
            obj.insert(field.to_string(), json!(allocation.value));
        }
        if !obj.contains_key("uniqueId") {
            obj.insert("uniqueId".into(), Value::String(Uuid::new_v4().to_string()));
        }
        Ok(order_id)
    }

    fn reconcile_lines(
        &self,
        store: &dyn TableStore,
        order_id: &str,
        lines: Vec<Value>,
    ) -> EngineResult<()> {
        let mut retained = BTreeSet::new();
        let mut retained_logs = BTreeSet::new();

        for mut line in lines {
            let Some(obj) = line.as_object_mut() else {
                continue;
            };
            let line_id = ensure_id(obj);
            obj.insert("orderId".into(), Value::String(order_id.to_string()));
            let logs = take_array(obj, "statusLogs");
            store.save(TABLE_ORDER_LINE, Value::Object(obj.clone()))?;
            retained.insert(line_id.clone());

            for mut log in logs {
                let Some(log_obj) = log.as_object_mut() else {
                    continue;
                };
                let log_id = ensure_id(log_obj);
                log_obj.insert("orderId".into(), Value::String(order_id.to_string()));
                log_obj.insert("lineId".into(), Value::String(line_id.clone()));
                store.save(TABLE_ORDER_LINE_STATUS_LOG, Value::Object(log_obj.clone()))?;
                retained_logs.insert(log_id);
            }
        }

        prune_stale(store, TABLE_ORDER_LINE, order_id, &retained)?;
        // Logs of pruned lines go with them; freshly written logs stay.
        let live_logs: BTreeSet<String> = store
            .list_table(TABLE_ORDER_LINE_STATUS_LOG)
            .iter()
            .filter(|row| order_id_of(row) == Some(order_id))
            .filter(|row| {
                row.get("lineId")
                    .and_then(Value::as_str)
                    .is_some_and(|line| retained.contains(line))
            })
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        prune_stale(store, TABLE_ORDER_LINE_STATUS_LOG, order_id, &live_logs)
    }

    fn reconcile_payments(
        &self,
        store: &dyn TableStore,
        order_id: &str,
        header: &Value,
        payments: Vec<Value>,
    ) -> EngineResult<()> {
        let mut retained = BTreeSet::new();
        for mut payment in payments {
            let Some(obj) = payment.as_object_mut() else {
                continue;
            };
            let id = ensure_id(obj);
            obj.insert("orderId".into(), Value::String(order_id.to_string()));
            normalize_payment(obj, header);
            store.save(TABLE_ORDER_PAYMENT, Value::Object(obj.clone()))?;
            retained.insert(id);
        }
        prune_stale(store, TABLE_ORDER_PAYMENT, order_id, &retained)
    }

    fn reconcile_status_logs(
        &self,
        store: &dyn TableStore,
        order_id: &str,
        logs: Vec<Value>,
    ) -> EngineResult<()> {
        let mut retained = BTreeSet::new();
        for mut log in logs {
            let Some(obj) = log.as_object_mut() else {
                continue;
            };
            let id = ensure_id(obj);
            obj.insert("orderId".into(), Value::String(order_id.to_string()));
            store.save(TABLE_ORDER_STATUS_LOG, Value::Object(obj.clone()))?;
            retained.insert(id);
        }
        prune_stale(store, TABLE_ORDER_STATUS_LOG, order_id, &retained)
    }
}

fn unwrap_envelope(order: Value) -> EngineResult<Value> {
    let Some(obj) = order.as_object() else {
        return Err(EngineError::InvalidPayload("order must be an object".into()));
    };
    if !obj.contains_key("lines") && !obj.contains_key("id") {
        if let Some(inner @ Value::Object(_)) = obj.get("order") {
            return Ok(inner.clone());
        }
    }
    Ok(order)
}

fn normalize_payment(obj: &mut Map<String, Value>, header: &Value) {
    let amount = match obj.get("amount") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    obj.insert("amount".into(), json!(amount));

    if !obj.contains_key("capturedAt") {
        obj.insert("capturedAt".into(), json!(now_millis()));
    }

    let method = ["paymentMethodId", "method", "methodId"]
        .iter()
        .find_map(|f| {
            obj.get(*f)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "cash".to_string());
    obj.insert("paymentMethodId".into(), Value::String(method));

    if !obj.contains_key("shiftId") {
        if let Some(shift) = header.get("shiftId").cloned() {
            obj.insert("shiftId".into(), shift);
        }
    }
    if !obj.contains_key("reference") {
        if let Some(reference) = obj.remove("ref") {
            obj.insert("reference".into(), reference);
        }
    }
}

fn prune_stale(
    store: &dyn TableStore,
    table: &str,
    order_id: &str,
    retained: &BTreeSet<String>,
) -> EngineResult<()> {
    let stale: Vec<String> = store
        .list_table(table)
        .iter()
        .filter(|row| order_id_of(row) == Some(order_id))
        .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
        .filter(|id| !retained.contains(id))
        .collect();
    for id in stale {
        store.remove(table, &RecordRef::from_id(&id))?;
        tracing::debug!(table, order_id, id, "pruned stale child row");
    }
    Ok(())
}

/// Deletes every row belonging to an order, children first.
fn purge_order_rows(store: &dyn TableStore, order_id: &str) -> EngineResult<()> {
    for table in [
        TABLE_ORDER_LINE_STATUS_LOG,
        TABLE_ORDER_LINE,
        TABLE_ORDER_PAYMENT,
        TABLE_ORDER_STATUS_LOG,
    ] {
        let ids: Vec<String> = store
            .list_table(table)
            .iter()
            .filter(|row| order_id_of(row) == Some(order_id))
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        for id in ids {
            store.remove(table, &RecordRef::from_id(&id))?;
        }
    }
    store.remove(TABLE_ORDER_HEADER, &RecordRef::from_id(order_id))?;
    Ok(())
}

/// Reassembles one order aggregate from its rows.
///
/// Lines carry their status logs inline, mirroring the shape clients
/// submit. Returns `None` when the header does not exist.
pub fn fetch_order_snapshot(store: &dyn TableStore, order_id: &str) -> Option<Value> {
    let header = store
        .list_table(TABLE_ORDER_HEADER)
        .into_iter()
        .find(|row| row.get("id").and_then(Value::as_str) == Some(order_id))?;

    let line_logs: Vec<Value> = store
        .list_table(TABLE_ORDER_LINE_STATUS_LOG)
        .into_iter()
        .filter(|row| order_id_of(row) == Some(order_id))
        .collect();

    let lines: Vec<Value> = store
        .list_table(TABLE_ORDER_LINE)
        .into_iter()
        .filter(|row| order_id_of(row) == Some(order_id))
        .map(|mut line| {
            let line_id = line.get("id").and_then(Value::as_str).map(str::to_string);
            let logs: Vec<Value> = line_logs
                .iter()
                .filter(|log| {
                    log.get("lineId").and_then(Value::as_str).map(str::to_string) == line_id
                })
                .cloned()
                .collect();
            if let Some(obj) = line.as_object_mut() {
                obj.insert("statusLogs".into(), Value::Array(logs));
            }
            line
        })
        .collect();

    let payments: Vec<Value> = store
        .list_table(TABLE_ORDER_PAYMENT)
        .into_iter()
        .filter(|row| order_id_of(row) == Some(order_id))
        .collect();

    let status_logs: Vec<Value> = store
        .list_table(TABLE_ORDER_STATUS_LOG)
        .into_iter()
        .filter(|row| order_id_of(row) == Some(order_id))
        .collect();

    Some(json!({
        "order": header,
        "lines": lines,
        "payments": payments,
        "statusLogs": status_logs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{MemoryStatePersistence, SequenceRule, StaticRules};
    use branchsync_store::MemoryStore;

    fn order_store() -> MemoryStore {
        MemoryStore::new([
            TABLE_ORDER_HEADER,
            TABLE_ORDER_LINE,
            TABLE_ORDER_PAYMENT,
            TABLE_ORDER_STATUS_LOG,
            TABLE_ORDER_LINE_STATUS_LOG,
        ])
    }

    fn orchestrator() -> OrderOrchestrator<StaticRules, MemoryStatePersistence> {
        let rules = StaticRules::new();
        rules.insert(
            TABLE_ORDER_HEADER,
            "id",
            SequenceRule {
                prefix: "INV".into(),
                padding: 4,
                ..SequenceRule::default()
            },
        );
        OrderOrchestrator::new(
            SequenceAllocator::new(rules, MemoryStatePersistence::new()),
            InFlightLocks::new(),
        )
    }

    #[test]
    fn draft_id_shapes() {
        assert!(is_draft_order_id(None));
        assert!(is_draft_order_id(Some("")));
        assert!(is_draft_order_id(Some("draft-abc")));
        assert!(is_draft_order_id(Some("DRAFT-xyz")));
        assert!(is_draft_order_id(Some("POS1-1756200000000-003")));
        assert!(!is_draft_order_id(Some("INV-0001")));
        assert!(!is_draft_order_id(Some("POS1-12345-003")));
        assert!(!is_draft_order_id(Some("POS_1-1756200000000-003")));
    }

    #[test]
    fn empty_aggregate_rejected_before_any_write() {
        let store = order_store();
        let err = orchestrator()
            .save_order(&store, "b1", json!({ "id": "draft-1", "lines": [] }))
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyAggregate));
        assert!(store.is_empty(TABLE_ORDER_HEADER));
    }

    #[test]
    fn non_object_lines_do_not_count_as_lines() {
        let store = order_store();
        let err = orchestrator()
            .save_order(
                &store,
                "b1",
                json!({ "id": "draft-2", "lines": [null, 42, "oops"] }),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::EmptyAggregate));
        assert!(store.is_empty(TABLE_ORDER_HEADER));
        assert!(store.is_empty(TABLE_ORDER_LINE));
    }

    #[test]
    fn draft_promotion_assigns_sequenced_id() {
        let store = order_store();
        let saved = orchestrator()
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "draft-77",
                    "lines": [{ "id": "L1", "sku": "espresso" }]
                }),
            )
            .unwrap();
        assert_eq!(saved.order_id, "INV-0001");
        assert!(saved.created);
        assert_eq!(saved.header["metadata"]["invoiceSequence"], 1);
        assert!(saved.header["uniqueId"].as_str().is_some());
        assert!(saved.header["updatedAt"].is_number());

        let lines = store.list_table(TABLE_ORDER_LINE);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["orderId"], "INV-0001");
    }

    #[test]
    fn draft_remnants_purged_after_promotion() {
        let store = order_store();
        // Remnants of an earlier local save under the draft id.
        store
            .save(TABLE_ORDER_HEADER, json!({ "id": "draft-9" }))
            .unwrap();
        store
            .save(
                TABLE_ORDER_LINE,
                json!({ "id": "L0", "orderId": "draft-9" }),
            )
            .unwrap();

        orchestrator()
            .save_order(
                &store,
                "b1",
                json!({ "id": "draft-9", "lines": [{ "id": "L1" }] }),
            )
            .unwrap();

        let headers = store.list_table(TABLE_ORDER_HEADER);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0]["id"], "INV-0001");
        let lines = store.list_table(TABLE_ORDER_LINE);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["orderId"], "INV-0001");
    }

    #[test]
    fn child_reconciliation_prunes_removed_lines() {
        let store = order_store();
        let orchestrator = orchestrator();
        orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0042",
                    "lines": [{ "id": "A" }, { "id": "B" }]
                }),
            )
            .unwrap();

        orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0042",
                    "lines": [{ "id": "B" }, { "id": "C" }]
                }),
            )
            .unwrap();

        let ids: Vec<String> = store
            .list_table(TABLE_ORDER_LINE)
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, ["B", "C"]);
    }

    #[test]
    fn duplicate_version_rejected_without_line_growth() {
        let store = order_store();
        let orchestrator = orchestrator();
        orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0042",
                    "version": 3,
                    "lines": [{ "id": "A" }]
                }),
            )
            .unwrap();

        let err = orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0042",
                    "version": 3,
                    "lines": [{ "id": "A" }]
                }),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::DuplicateVersion { ref id, version: 3 } if id == "INV-0042"
        ));
    }

    #[test]
    fn duplicate_version_accepted_with_line_growth() {
        let store = order_store();
        let orchestrator = orchestrator();
        orchestrator
            .save_order(
                &store,
                "b1",
                json!({ "id": "INV-0042", "version": 3, "lines": [{ "id": "A" }] }),
            )
            .unwrap();

        let saved = orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0042",
                    "version": 3,
                    "lines": [{ "id": "A" }, { "id": "B" }]
                }),
            )
            .unwrap();
        assert!(!saved.created);
        assert_eq!(store.len(TABLE_ORDER_LINE), 2);
    }

    #[test]
    fn payments_are_normalized() {
        let store = order_store();
        orchestrator()
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0050",
                    "shiftId": "shift-4",
                    "lines": [{ "id": "L1" }],
                    "payments": [
                        { "amount": "12.50", "method": "card", "ref": "tx-9" },
                        { "id": "P2" }
                    ]
                }),
            )
            .unwrap();

        let payments = store.list_table(TABLE_ORDER_PAYMENT);
        assert_eq!(payments.len(), 2);
        let card = payments
            .iter()
            .find(|p| p["paymentMethodId"] == "card")
            .unwrap();
        assert_eq!(card["amount"], 12.5);
        assert_eq!(card["reference"], "tx-9");
        assert_eq!(card["shiftId"], "shift-4");
        assert!(card["capturedAt"].is_number());

        let fallback = payments.iter().find(|p| p["id"] == "P2").unwrap();
        assert_eq!(fallback["paymentMethodId"], "cash");
        assert_eq!(fallback["amount"], 0.0);
    }

    #[test]
    fn line_status_logs_stamped_and_pruned_with_lines() {
        let store = order_store();
        let orchestrator = orchestrator();
        orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0060",
                    "lines": [
                        { "id": "A", "statusLogs": [{ "id": "G1", "status": "fired" }] },
                        { "id": "B", "statusLogs": [{ "id": "G2", "status": "fired" }] }
                    ]
                }),
            )
            .unwrap();

        let logs = store.list_table(TABLE_ORDER_LINE_STATUS_LOG);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["orderId"], "INV-0060");
        assert_eq!(logs[0]["lineId"], "A");

        orchestrator
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0060",
                    "lines": [
                        { "id": "B", "statusLogs": [{ "id": "G2", "status": "served" }] }
                    ]
                }),
            )
            .unwrap();

        let logs = store.list_table(TABLE_ORDER_LINE_STATUS_LOG);
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0]["lineId"], "B");
        assert_eq!(logs[0]["status"], "served");
    }

    #[test]
    fn envelope_shape_unwrapped() {
        let store = order_store();
        let saved = orchestrator()
            .save_order(
                &store,
                "b1",
                json!({ "order": { "id": "draft-1", "lines": [{ "id": "L1" }] } }),
            )
            .unwrap();
        assert_eq!(saved.order_id, "INV-0001");
    }

    #[test]
    fn snapshot_reassembles_aggregate() {
        let store = order_store();
        orchestrator()
            .save_order(
                &store,
                "b1",
                json!({
                    "id": "INV-0070",
                    "lines": [{ "id": "A", "statusLogs": [{ "id": "G1" }] }],
                    "payments": [{ "id": "P1", "amount": 5 }],
                    "statusLogs": [{ "id": "S1", "status": "closed" }]
                }),
            )
            .unwrap();

        let snapshot = fetch_order_snapshot(&store, "INV-0070").unwrap();
        assert_eq!(snapshot["order"]["id"], "INV-0070");
        assert_eq!(snapshot["lines"][0]["statusLogs"][0]["id"], "G1");
        assert_eq!(snapshot["payments"][0]["amount"], 5.0);
        assert_eq!(snapshot["statusLogs"][0]["status"], "closed");

        assert!(fetch_order_snapshot(&store, "missing").is_none());
    }
}

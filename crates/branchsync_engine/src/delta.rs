//! Insert-only delta computation.

use branchsync_protocol::{normalize_cursor_input, DeltaOutcome};
use branchsync_store::TableStore;
use serde_json::Value;

/// Computes the rows appended to a table after the client's cursor.
///
/// The row sequence is scanned from the end backward for the first row
/// matching any cursor candidate; recent writes sit near the tail, so
/// the scan exits early in the common case. A cursor that cannot be
/// located in a non-empty table forces a full resync: the client's
/// anchor no longer exists, likely because the table was purged or
/// reset. An empty client cursor returns the entire table (first sync).
///
/// The returned `last_cursor` is always derived from the table's current
/// last row, regardless of match outcome, so the client can re-anchor
/// even after a forced full sync.
pub fn compute_insert_only_delta(
    store: &dyn TableStore,
    table: &str,
    cursor_value: &Value,
) -> DeltaOutcome {
    let rows = if store.has_table(table) {
        store.list_table(table)
    } else {
        Vec::new()
    };
    let normalized = normalize_cursor_input(cursor_value);

    let mut start_index = 0;
    let mut matched = false;
    if normalized.has_candidates() {
        for idx in (0..rows.len()).rev() {
            let Some(reference) = store.record_reference(table, &rows[idx]) else {
                continue;
            };
            if reference.matches(&normalized.candidates) {
                matched = true;
                start_index = idx + 1;
                break;
            }
        }
    }

    let had_cursor = normalized.has_candidates();
    let requires_full_sync = had_cursor && !matched && !rows.is_empty();
    let last_cursor = rows
        .last()
        .and_then(|row| store.record_reference(table, row));
    let total = rows.len();
    let delta_rows = rows.into_iter().skip(start_index).collect::<Vec<_>>();

    tracing::debug!(
        table,
        total,
        returned = delta_rows.len(),
        matched,
        requires_full_sync,
        "computed insert-only delta"
    );

    DeltaOutcome {
        rows: delta_rows,
        total,
        last_cursor,
        matched,
        requires_full_sync,
        client_cursor: normalized.object,
        had_cursor,
    }
}

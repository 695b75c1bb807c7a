//! Sequence audit, repair, and collision-safe allocation.

use super::allocator::{Allocation, AllocationContext, SequenceAllocator};
use super::{DatePosition, RuleSource, SequenceRule, SequenceStatePersistence};
use crate::error::{EngineError, EngineResult};
use branchsync_store::TableStore;
use serde_json::Value;

/// Bounded retry for collision-safe allocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

/// Reverse-parses a formatted id back to its raw counter value.
///
/// Returns `None` when the id does not match the rule's shape. The
/// `date_tag` is today's tag; with an infix date the tag is not required
/// to match (older rows parse too), but a suffix-positioned tag must be
/// present for the counter position to be unambiguous.
pub fn extract_sequence_from_id(
    rule: &SequenceRule,
    id: &str,
    date_tag: &str,
) -> Option<i64> {
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    let delimiter = rule.delimiter();

    if delimiter.is_empty() {
        let mut rest = id;
        if !rule.prefix.is_empty() {
            rest = rest.strip_prefix(rule.prefix.as_str())?;
        }
        if !rule.suffix.is_empty() {
            rest = rest.strip_suffix(rule.suffix.as_str())?;
        }
        if rule.include_date {
            rest = match rule.date_position {
                DatePosition::Infix => rest.strip_prefix(date_tag)?,
                DatePosition::Suffix => rest.strip_suffix(date_tag)?,
            };
        }
        return parse_counter(rest, rule.pad_char);
    }

    let mut parts: Vec<&str> = id.split(delimiter).filter(|p| !p.is_empty()).collect();
    if !rule.prefix.is_empty() {
        if parts.first() != Some(&rule.prefix.as_str()) {
            return None;
        }
        parts.remove(0);
    }
    if !rule.suffix.is_empty() {
        if parts.last() != Some(&rule.suffix.as_str()) {
            return None;
        }
        parts.pop();
    }
    if rule.include_date && rule.date_position == DatePosition::Suffix {
        parts.pop()?;
    }
    parse_counter(parts.last()?, rule.pad_char)
}

fn parse_counter(raw: &str, pad_char: char) -> Option<i64> {
    let trimmed = raw.trim_start_matches(pad_char);
    if trimmed.is_empty() {
        // All zero padding means the counter itself is zero.
        return (!raw.is_empty() && pad_char == '0').then_some(0);
    }
    trimmed.parse().ok()
}

fn sequence_metadata(row: &Value) -> Option<i64> {
    const FIELDS: [&str; 2] = ["invoiceSequence", "invoice_sequence"];
    let scopes = [Some(row), row.get("metadata"), row.get("meta")];
    for scope in scopes.into_iter().flatten() {
        for field in FIELDS {
            match scope.get(field) {
                Some(Value::Number(n)) => {
                    if let Some(v) = n.as_i64() {
                        return Some(v);
                    }
                }
                Some(Value::String(s)) => {
                    if let Ok(v) = s.trim().parse::<i64>() {
                        return Some(v);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn row_id(row: &Value) -> Option<&str> {
    const FIELDS: [&str; 3] = ["id", "orderId", "order_id"];
    FIELDS.iter().find_map(|f| row.get(*f).and_then(Value::as_str))
}

/// Audits a table's rows against the persisted counter and raises the
/// counter when rows prove it fell behind.
///
/// Rows expose their counter either through sequence metadata or by
/// reverse-parsing their formatted id. With a daily rule, rows whose id
/// does not carry today's date tag belong to another day and are
/// skipped. Returns the highest counter observed, if any.
pub fn audit_and_repair<R, P>(
    allocator: &SequenceAllocator<R, P>,
    store: &dyn TableStore,
    ctx: &AllocationContext<'_>,
) -> EngineResult<Option<i64>>
where
    R: RuleSource,
    P: SequenceStatePersistence,
{
    let Some(preview) = allocator.preview_next_value(ctx)? else {
        return Ok(None);
    };
    let rule = preview.rule;
    let tag = rule.date_tag(ctx.today);

    let mut observed_max: Option<i64> = None;
    for row in store.list_table(ctx.table) {
        let id = row_id(&row);
        if rule.is_daily() && !id.is_some_and(|id| id.contains(&tag)) {
            continue;
        }
        let observed = sequence_metadata(&row)
            .or_else(|| id.and_then(|id| extract_sequence_from_id(&rule, id, &tag)));
        if let Some(value) = observed {
            observed_max = Some(observed_max.map_or(value, |m| m.max(value)));
        }
    }

    if let Some(max) = observed_max {
        allocator.raise_floor(ctx, max)?;
    }
    Ok(observed_max)
}

fn formatted_exists(store: &dyn TableStore, table: &str, formatted: &str) -> bool {
    store.list_table(table).iter().any(|row| {
        row_id(row) == Some(formatted)
            || row.get("key").and_then(Value::as_str) == Some(formatted)
    })
}

/// Allocates a formatted value guaranteed absent from the table.
///
/// The counter is audited first, then each allocated value is verified
/// against existing rows. A collision means some writer bypassed the
/// allocator, so the audit runs again before the next attempt. Gives up
/// with [`EngineError::SequenceCollision`] after the policy's attempts.
pub fn allocate_with_retry<R, P>(
    allocator: &SequenceAllocator<R, P>,
    store: &dyn TableStore,
    ctx: &AllocationContext<'_>,
    retry: &RetryPolicy,
) -> EngineResult<Allocation>
where
    R: RuleSource,
    P: SequenceStatePersistence,
{
    audit_and_repair(allocator, store, ctx)?;

    let mut last_formatted = String::new();
    for attempt in 1..=retry.max_attempts {
        let allocation =
            allocator
                .next_value(ctx)?
                .ok_or_else(|| EngineError::MissingRule {
                    table: ctx.table.to_string(),
                    field: ctx.field.to_string(),
                })?;
        if !formatted_exists(store, ctx.table, &allocation.formatted) {
            return Ok(allocation);
        }
        tracing::warn!(
            table = ctx.table,
            formatted = allocation.formatted,
            attempt,
            "allocated sequence value already exists, repairing"
        );
        last_formatted = allocation.formatted;
        audit_and_repair(allocator, store, ctx)?;
    }

    Err(EngineError::SequenceCollision {
        formatted: last_formatted,
        attempts: retry.max_attempts,
    })
}

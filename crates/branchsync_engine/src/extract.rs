//! Nested field extraction over heterogeneous record envelopes.
//!
//! Records arrive from upstreams that nest the same logical field at
//! different depths (`header`, `payload`, `meta`, ...). Extraction is a
//! declarative list of candidate fields evaluated breadth-first over a
//! fixed set of envelope keys, so the contract stays explicit and
//! testable.

use chrono::{DateTime, NaiveDate};
use serde_json::Value;
use std::collections::VecDeque;

/// A declarative probe: which direct fields to look for, and which
/// envelope keys to descend into, both in priority order.
#[derive(Debug, Clone, Copy)]
pub struct FieldProbe {
    /// Direct field names, highest priority first.
    pub fields: &'static [&'static str],
    /// Envelope keys searched breadth-first.
    pub envelopes: &'static [&'static str],
}

/// Payment/workflow state probe.
pub const PAYMENT_STATE_PROBE: FieldProbe = FieldProbe {
    fields: &[
        "paymentState",
        "payment_state",
        "paymentStatus",
        "payment_status",
        "state",
        "payment_state_id",
        "paymentStateId",
    ],
    envelopes: &["header", "payload", "meta", "metadata", "data", "info"],
};

/// Last-update timestamp probe.
pub const UPDATED_AT_PROBE: FieldProbe = FieldProbe {
    fields: &[
        "updatedAt",
        "updated_at",
        "modifyDate",
        "modify_date",
        "savedAt",
        "saved_at",
        "timestamp",
        "ts",
        "lastUpdatedAt",
        "last_updated_at",
        "lastModifiedAt",
        "last_modified_at",
    ],
    envelopes: &["meta", "metadata", "header", "payload", "data", "info"],
};

/// Breadth-first search over a record's envelope objects.
///
/// `pick` inspects one object level at a time; the first `Some` wins.
pub fn nested_find<'a, T>(
    record: &'a Value,
    envelopes: &[&str],
    mut pick: impl FnMut(&'a serde_json::Map<String, Value>) -> Option<T>,
) -> Option<T> {
    let mut queue = VecDeque::new();
    queue.push_back(record);
    while let Some(current) = queue.pop_front() {
        let Some(obj) = current.as_object() else {
            continue;
        };
        if let Some(found) = pick(obj) {
            return Some(found);
        }
        for key in envelopes {
            if let Some(nested @ Value::Object(_)) = obj.get(*key) {
                queue.push_back(nested);
            }
        }
    }
    None
}

/// Resolves a timestamp input to epoch milliseconds.
///
/// Accepts finite numbers (taken as millis), numeric strings, RFC 3339
/// timestamps, and plain dates.
pub fn resolve_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                Some(int)
            } else {
                n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if let Ok(numeric) = trimmed.parse::<i64>() {
                return Some(numeric);
            }
            if let Ok(float) = trimmed.parse::<f64>() {
                if float.is_finite() {
                    return Some(float as i64);
                }
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
                return Some(ts.timestamp_millis());
            }
            if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                return date
                    .and_hms_opt(0, 0, 0)
                    .map(|dt| dt.and_utc().timestamp_millis());
            }
            None
        }
        _ => None,
    }
}

/// Extracts the payment state from a record or any of its envelopes.
pub fn extract_payment_state(record: &Value) -> Option<String> {
    nested_find(record, PAYMENT_STATE_PROBE.envelopes, |obj| {
        PAYMENT_STATE_PROBE.fields.iter().find_map(|field| {
            obj.get(*field)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    })
}

/// Extracts the last-update timestamp (epoch millis) from a record or
/// any of its envelopes.
pub fn extract_updated_at(record: &Value) -> Option<i64> {
    nested_find(record, UPDATED_AT_PROBE.envelopes, |obj| {
        UPDATED_AT_PROBE
            .fields
            .iter()
            .find_map(|field| obj.get(*field).and_then(resolve_timestamp))
    })
}

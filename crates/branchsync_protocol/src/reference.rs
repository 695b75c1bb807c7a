//! Canonical record references and cursor normalization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// A canonical reference to one row, regardless of which identifier
/// scheme the table uses.
///
/// A cursor is a `RecordRef` with every field stringified; it represents
/// the last row a client has seen for one table and is echoed back by the
/// client on its next sync request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordRef {
    /// Single-key identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Legacy numeric or string id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// UUID identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Alternate unique identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Composite primary key, field name to stringified value.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub primary_key: BTreeMap<String, String>,
}

impl RecordRef {
    /// Creates a reference carrying only an `id`.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Creates a reference carrying only a `key`.
    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Returns true if no identifier field is populated.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
            && self.id.is_none()
            && self.uuid.is_none()
            && self.uid.is_none()
            && self.primary_key.is_empty()
    }

    /// Returns true if any identifier field string-equals a candidate.
    pub fn matches(&self, candidates: &BTreeSet<String>) -> bool {
        if candidates.is_empty() {
            return false;
        }
        let fields = [&self.key, &self.id, &self.uuid, &self.uid];
        for field in fields.into_iter().flatten() {
            if candidates.contains(field) {
                return true;
            }
        }
        self.primary_key.values().any(|v| candidates.contains(v))
    }

    /// Derives the single string identity of this reference.
    ///
    /// Priority is `key`, then `id`, then `uuid`, then `uid`, then the
    /// first primary-key value in field order. Clients rely on this
    /// ordering for idempotency keys.
    pub fn as_string(&self) -> Option<String> {
        let direct = [&self.key, &self.id, &self.uuid, &self.uid];
        for field in direct.into_iter().flatten() {
            if !field.is_empty() {
                return Some(field.clone());
            }
        }
        self.primary_key.values().find(|v| !v.is_empty()).cloned()
    }
}

/// The result of normalizing a client-supplied cursor value.
#[derive(Debug, Clone, Default)]
pub struct NormalizedCursor {
    /// Every identifier string the cursor could refer to.
    pub candidates: BTreeSet<String>,
    /// The canonical cursor object, when any field was recognized.
    pub object: Option<RecordRef>,
}

impl NormalizedCursor {
    /// Returns true if the input carried at least one usable identifier.
    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }
}

fn scalar_to_string(raw: &Value) -> Option<String> {
    match raw {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => {
            if n.as_f64().map(f64::is_finite).unwrap_or(false) {
                Some(n.to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Normalizes a raw cursor value into a candidate set and canonical object.
///
/// Accepts either a raw scalar (treated as both `key` and `id`) or an
/// object exposing any of `key`, `id`, `uuid`, `uid`, `primaryKey`,
/// `primary`, or `value`. Unknown shapes yield an empty candidate set.
pub fn normalize_cursor_input(value: &Value) -> NormalizedCursor {
    let mut candidates = BTreeSet::new();
    let mut object = RecordRef::default();

    let mut register = |candidates: &mut BTreeSet<String>, raw: &Value| -> Option<String> {
        let text = scalar_to_string(raw)?;
        candidates.insert(text.clone());
        Some(text)
    };

    match value {
        Value::Object(map) => {
            if let Some(raw) = map.get("key") {
                object.key = register(&mut candidates, raw);
            }
            if let Some(raw) = map.get("id") {
                object.id = register(&mut candidates, raw);
            }
            if let Some(raw) = map.get("uuid") {
                object.uuid = register(&mut candidates, raw);
            }
            if let Some(raw) = map.get("uid") {
                object.uid = register(&mut candidates, raw);
            }
            for source in ["primaryKey", "primary"] {
                if let Some(Value::Object(pk)) = map.get(source) {
                    for (field, raw) in pk {
                        if let Some(text) = register(&mut candidates, raw) {
                            object.primary_key.insert(field.clone(), text);
                        }
                    }
                }
            }
            if object.is_empty() {
                if let Some(raw) = map.get("value") {
                    object.key = register(&mut candidates, raw);
                }
            }
        }
        Value::Null | Value::Bool(_) | Value::Array(_) => {}
        scalar => {
            if let Some(text) = register(&mut candidates, scalar) {
                object.key = Some(text.clone());
                object.id = Some(text);
            }
        }
    }

    let object = if object.is_empty() { None } else { Some(object) };
    NormalizedCursor { candidates, object }
}

//! In-memory table store.

use crate::error::{StoreError, StoreResult};
use crate::table::{SaveOutcome, TableStore};
use branchsync_protocol::RecordRef;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A thread-safe in-memory table store.
///
/// Suitable for embedding, unit tests, and integration tests. Rows are
/// kept per table in insertion order; identity fields (`key`, `id`,
/// `uuid`, `uid`) are read directly from rows, and composite primary
/// keys can be configured per table.
pub struct MemoryStore {
    tables: RwLock<BTreeMap<String, Vec<Value>>>,
    primary_keys: RwLock<BTreeMap<String, Vec<String>>>,
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn candidate_set(reference: &RecordRef) -> BTreeSet<String> {
    let mut candidates = BTreeSet::new();
    for field in [&reference.key, &reference.id, &reference.uuid, &reference.uid]
        .into_iter()
        .flatten()
    {
        candidates.insert(field.clone());
    }
    for value in reference.primary_key.values() {
        candidates.insert(value.clone());
    }
    candidates
}

impl MemoryStore {
    /// Creates a store with the given table names.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = tables
            .into_iter()
            .map(|name| (name.into(), Vec::new()))
            .collect();
        Self {
            tables: RwLock::new(map),
            primary_keys: RwLock::new(BTreeMap::new()),
        }
    }

    /// Declares a composite primary key for a table.
    pub fn set_primary_key<I, S>(&self, table: &str, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys.write().insert(
            table.to_string(),
            fields.into_iter().map(Into::into).collect(),
        );
    }

    /// Adds a table if it does not exist yet.
    pub fn add_table(&self, table: &str) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default();
    }

    /// Returns the row count of a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }

    fn reference_for(&self, table: &str, row: &Value) -> Option<RecordRef> {
        let obj = row.as_object()?;
        let mut reference = RecordRef::default();
        reference.key = obj.get("key").and_then(scalar_string);
        reference.id = obj.get("id").and_then(scalar_string);
        reference.uuid = obj.get("uuid").and_then(scalar_string);
        reference.uid = obj.get("uid").and_then(scalar_string);
        if let Some(fields) = self.primary_keys.read().get(table) {
            for field in fields {
                if let Some(value) = obj.get(field).and_then(scalar_string) {
                    reference.primary_key.insert(field.clone(), value);
                }
            }
        }
        if reference.is_empty() {
            None
        } else {
            Some(reference)
        }
    }
}

impl TableStore for MemoryStore {
    fn tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    fn list_table(&self, table: &str) -> Vec<Value> {
        self.tables
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn record_reference(&self, table: &str, row: &Value) -> Option<RecordRef> {
        self.reference_for(table, row)
    }

    fn save(&self, table: &str, mut record: Value) -> StoreResult<SaveOutcome> {
        if !self.has_table(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        let obj = record
            .as_object_mut()
            .ok_or_else(|| StoreError::InvalidRecord {
                table: table.to_string(),
                reason: "record must be an object".into(),
            })?;

        let expected_version = obj
            .remove("expectedVersion")
            .and_then(|v| v.as_u64());

        if self.reference_for(table, &record).is_none() {
            let obj = record
                .as_object_mut()
                .ok_or_else(|| StoreError::InvalidRecord {
                    table: table.to_string(),
                    reason: "record must be an object".into(),
                })?;
            obj.insert(
                "id".into(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }

        let incoming_ref = self
            .reference_for(table, &record)
            .ok_or_else(|| StoreError::InvalidRecord {
                table: table.to_string(),
                reason: "record exposes no identifier".into(),
            })?;
        let candidates = candidate_set(&incoming_ref);

        let mut tables = self.tables.write();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let position = rows.iter().position(|row| {
            self.reference_for(table, row)
                .map(|r| r.matches(&candidates))
                .unwrap_or(false)
        });

        match position {
            Some(idx) => {
                if let Some(expected) = expected_version {
                    let current = rows[idx]
                        .get("version")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    if current != expected {
                        return Err(StoreError::VersionConflict {
                            table: table.to_string(),
                            key: incoming_ref.as_string().unwrap_or_default(),
                            expected,
                            current,
                        });
                    }
                }
                rows[idx] = record.clone();
                Ok(SaveOutcome {
                    record,
                    created: false,
                })
            }
            None => {
                rows.push(record.clone());
                Ok(SaveOutcome {
                    record,
                    created: true,
                })
            }
        }
    }

    fn remove(&self, table: &str, reference: &RecordRef) -> StoreResult<bool> {
        if !self.has_table(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }
        let candidates = candidate_set(reference);
        let mut tables = self.tables.write();
        let rows = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;
        let position = rows.iter().position(|row| {
            self.reference_for(table, row)
                .map(|r| r.matches(&candidates))
                .unwrap_or(false)
        });
        match position {
            Some(idx) => {
                rows.remove(idx);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

//! Data-driven sequence allocation.
//!
//! Sequences are defined by per (table, field) rules: a numeric counter
//! with optional prefix, suffix, padding, date tag, and a reset policy.
//! Allocated counters are persisted per branch so restarts never reuse a
//! value, and the repair path can raise the counter when existing rows
//! prove it fell behind.

mod allocator;
mod repair;

pub use allocator::{Allocation, AllocationContext, SequenceAllocator};
pub use repair::{allocate_with_retry, audit_and_repair, extract_sequence_from_id, RetryPolicy};

use crate::error::EngineResult;
use branchsync_store::StoreError;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// When the counter resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetPolicy {
    /// The counter never resets.
    #[default]
    None,
    /// The counter restarts at `start` every business day.
    #[serde(alias = "day")]
    Daily,
}

/// Where the date tag sits in a formatted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatePosition {
    /// Between the prefix and the counter.
    #[default]
    Infix,
    /// After the counter.
    Suffix,
}

fn default_start() -> i64 {
    1
}

fn default_pad_char() -> char {
    '0'
}

/// A sequence formatting and reset rule for one (table, field) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SequenceRule {
    /// First value of a fresh or reset counter.
    pub start: i64,
    /// Literal prefix.
    pub prefix: String,
    /// Literal suffix.
    pub suffix: String,
    /// Separator between parts. Absent means `-`; an empty string means
    /// the parts are concatenated.
    pub delimiter: Option<String>,
    /// Minimum counter width.
    #[serde(alias = "pad")]
    pub padding: usize,
    /// Fill character for padding.
    #[serde(alias = "padWith")]
    pub pad_char: char,
    /// Whether formatted values carry a date tag.
    #[serde(alias = "withDate")]
    pub include_date: bool,
    /// Date tag pattern (`YYYY`, `YY`, `MM`, `DD` placeholders).
    pub date_format: Option<String>,
    /// Date tag placement.
    #[serde(alias = "datePlacement")]
    pub date_position: DatePosition,
    /// Reset policy.
    #[serde(alias = "resetEvery", alias = "period", alias = "scope")]
    pub reset: ResetPolicy,
    /// Record field that receives the raw counter, when set.
    pub counter_field: Option<String>,
}

impl Default for SequenceRule {
    fn default() -> Self {
        Self {
            start: default_start(),
            prefix: String::new(),
            suffix: String::new(),
            delimiter: None,
            padding: 0,
            pad_char: default_pad_char(),
            include_date: false,
            date_format: None,
            date_position: DatePosition::default(),
            reset: ResetPolicy::default(),
            counter_field: None,
        }
    }
}

impl SequenceRule {
    /// Returns true when the counter resets daily.
    pub fn is_daily(&self) -> bool {
        self.reset == ResetPolicy::Daily
    }

    /// The effective part separator.
    pub fn delimiter(&self) -> &str {
        self.delimiter.as_deref().unwrap_or("-")
    }

    /// Renders the date tag for a given day.
    pub fn date_tag(&self, date: NaiveDate) -> String {
        let pattern = self.date_format.as_deref().unwrap_or("YYYYMMDD");
        pattern
            .replace("YYYY", &date.format("%Y").to_string())
            .replace("YY", &date.format("%y").to_string())
            .replace("MM", &date.format("%m").to_string())
            .replace("DD", &date.format("%d").to_string())
    }

    fn padded(&self, value: i64) -> String {
        let text = value.to_string();
        if text.len() >= self.padding {
            return text;
        }
        let mut padded = String::new();
        for _ in 0..(self.padding - text.len()) {
            padded.push(self.pad_char);
        }
        padded.push_str(&text);
        padded
    }

    /// Formats one counter value for a given day.
    pub fn format_value(&self, value: i64, date: NaiveDate) -> String {
        let mut parts: Vec<String> = Vec::new();
        if !self.prefix.is_empty() {
            parts.push(self.prefix.clone());
        }
        if self.include_date {
            match self.date_position {
                DatePosition::Infix => {
                    parts.push(self.date_tag(date));
                    parts.push(self.padded(value));
                }
                DatePosition::Suffix => {
                    parts.push(self.padded(value));
                    parts.push(self.date_tag(date));
                }
            }
        } else {
            parts.push(self.padded(value));
        }
        if !self.suffix.is_empty() {
            parts.push(self.suffix.clone());
        }
        parts.join(self.delimiter())
    }
}

/// Builds the canonical sequence key `module:table:field`.
pub fn build_sequence_key(module_id: Option<&str>, table: &str, field: &str) -> String {
    let module = module_id
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .unwrap_or("pos");
    format!("{module}:{table}:{field}")
}

/// Source of sequence rules.
pub trait RuleSource: Send + Sync {
    /// Returns the rule for a (table, field) pair, if one is configured.
    fn rule_for(&self, table: &str, field: &str) -> Option<SequenceRule>;

    /// Returns every (field, rule) pair configured for a table.
    fn rules_for_table(&self, table: &str) -> Vec<(String, SequenceRule)>;

    /// Records a rule the allocator created on the fly. No-op by default.
    fn record_auto_rule(&self, _table: &str, _field: &str, _rule: &SequenceRule) {}
}

/// An in-memory rule table.
#[derive(Default)]
pub struct StaticRules {
    rules: RwLock<HashMap<(String, String), SequenceRule>>,
}

impl StaticRules {
    /// Creates an empty rule table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule for a (table, field) pair.
    pub fn insert(&self, table: impl Into<String>, field: impl Into<String>, rule: SequenceRule) {
        self.rules
            .write()
            .insert((table.into(), field.into()), rule);
    }
}

impl RuleSource for StaticRules {
    fn rule_for(&self, table: &str, field: &str) -> Option<SequenceRule> {
        self.rules
            .read()
            .get(&(table.to_string(), field.to_string()))
            .cloned()
    }

    fn rules_for_table(&self, table: &str) -> Vec<(String, SequenceRule)> {
        self.rules
            .read()
            .iter()
            .filter(|((t, _), _)| t == table)
            .map(|((_, field), rule)| (field.clone(), rule.clone()))
            .collect()
    }

    fn record_auto_rule(&self, table: &str, field: &str, rule: &SequenceRule) {
        self.insert(table, field, rule.clone());
    }
}

impl<R: RuleSource + ?Sized> RuleSource for std::sync::Arc<R> {
    fn rule_for(&self, table: &str, field: &str) -> Option<SequenceRule> {
        (**self).rule_for(table, field)
    }

    fn rules_for_table(&self, table: &str) -> Vec<(String, SequenceRule)> {
        (**self).rules_for_table(table)
    }

    fn record_auto_rule(&self, table: &str, field: &str, rule: &SequenceRule) {
        (**self).record_auto_rule(table, field, rule);
    }
}

/// One persisted counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEntry {
    /// Last allocated counter value.
    pub last: i64,
    /// When the counter last moved (ISO-8601).
    pub updated_at: String,
}

/// All counters of one branch, keyed by sequence key (daily counters
/// carry a `::<date tag>` suffix).
pub type BranchSequenceState = BTreeMap<String, SequenceEntry>;

/// Durable storage for branch sequence state.
pub trait SequenceStatePersistence: Send + Sync {
    /// Loads the state of a branch; absent state is empty.
    fn load(&self, branch_id: &str) -> EngineResult<BranchSequenceState>;

    /// Stores the full state of a branch.
    fn store(&self, branch_id: &str, state: &BranchSequenceState) -> EngineResult<()>;
}

impl<P: SequenceStatePersistence + ?Sized> SequenceStatePersistence for std::sync::Arc<P> {
    fn load(&self, branch_id: &str) -> EngineResult<BranchSequenceState> {
        (**self).load(branch_id)
    }

    fn store(&self, branch_id: &str, state: &BranchSequenceState) -> EngineResult<()> {
        (**self).store(branch_id, state)
    }
}

/// In-memory persistence for tests and embedders without a data dir.
#[derive(Default)]
pub struct MemoryStatePersistence {
    states: RwLock<HashMap<String, BranchSequenceState>>,
}

impl MemoryStatePersistence {
    /// Creates empty in-memory persistence.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceStatePersistence for MemoryStatePersistence {
    fn load(&self, branch_id: &str) -> EngineResult<BranchSequenceState> {
        Ok(self
            .states
            .read()
            .get(branch_id)
            .cloned()
            .unwrap_or_default())
    }

    fn store(&self, branch_id: &str, state: &BranchSequenceState) -> EngineResult<()> {
        self.states
            .write()
            .insert(branch_id.to_string(), state.clone());
        Ok(())
    }
}

/// File-backed persistence: one `sequence-state.json` per branch.
pub struct FileStatePersistence {
    root: PathBuf,
}

impl FileStatePersistence {
    /// Creates persistence rooted at a data directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn state_path(&self, branch_id: &str) -> PathBuf {
        self.root.join(branch_id).join("sequence-state.json")
    }
}

impl SequenceStatePersistence for FileStatePersistence {
    fn load(&self, branch_id: &str) -> EngineResult<BranchSequenceState> {
        let path = self.state_path(branch_id);
        if !path.exists() {
            return Ok(BranchSequenceState::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(StoreError::from)?;
        let state = serde_json::from_str(&raw).map_err(StoreError::from)?;
        Ok(state)
    }

    fn store(&self, branch_id: &str, state: &BranchSequenceState) -> EngineResult<()> {
        let path = self.state_path(branch_id);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(StoreError::from)?;
        }
        let raw = serde_json::to_string_pretty(state).map_err(StoreError::from)?;
        std::fs::write(&path, raw).map_err(StoreError::from)?;
        Ok(())
    }
}

//! The sequence allocator.

use super::{
    build_sequence_key, BranchSequenceState, RuleSource, SequenceEntry, SequenceRule,
    SequenceStatePersistence,
};
use crate::error::EngineResult;
use branchsync_protocol::SequenceRequest;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Everything identifying one allocation target.
#[derive(Debug, Clone)]
pub struct AllocationContext<'a> {
    /// Tenant branch id.
    pub branch_id: &'a str,
    /// Module id; defaults to `pos` in the sequence key.
    pub module_id: Option<&'a str>,
    /// Target table.
    pub table: &'a str,
    /// Sequence-bearing field.
    pub field: &'a str,
    /// Business day used for date tags and daily resets.
    pub today: NaiveDate,
}

impl<'a> AllocationContext<'a> {
    /// Creates a context for today.
    pub fn new(branch_id: &'a str, table: &'a str, field: &'a str) -> Self {
        Self {
            branch_id,
            module_id: None,
            table,
            field,
            today: Utc::now().date_naive(),
        }
    }

    /// Sets the module id.
    pub fn with_module(mut self, module_id: &'a str) -> Self {
        self.module_id = Some(module_id);
        self
    }

    /// Overrides the business day.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    fn sequence_key(&self) -> String {
        build_sequence_key(self.module_id, self.table, self.field)
    }
}

/// One allocated (or previewed) sequence value.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// The raw counter value.
    pub value: i64,
    /// The formatted value per the rule.
    pub formatted: String,
    /// The canonical sequence key.
    pub sequence_key: String,
    /// The state key the counter was stored under (daily counters carry
    /// the date tag).
    pub state_key: String,
    /// The rule that produced this allocation.
    pub rule: SequenceRule,
}

/// Allocates sequence values against persisted per-branch counters.
///
/// All counter movement happens under one lock, with persistence inside
/// the critical section, so two concurrent allocations can never hand
/// out the same value.
pub struct SequenceAllocator<R, P> {
    rules: R,
    persistence: P,
    cache: Mutex<HashMap<String, BranchSequenceState>>,
    auto_create: bool,
}

impl<R: RuleSource, P: SequenceStatePersistence> SequenceAllocator<R, P> {
    /// Creates an allocator over a rule source and persistence.
    pub fn new(rules: R, persistence: P) -> Self {
        Self {
            rules,
            persistence,
            cache: Mutex::new(HashMap::new()),
            auto_create: false,
        }
    }

    /// When enabled, a missing rule yields a plain unpadded counter
    /// starting at 1 instead of no allocation, and the rule is recorded
    /// back into the source.
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    fn resolve_rule(&self, ctx: &AllocationContext<'_>) -> Option<SequenceRule> {
        if let Some(rule) = self.rules.rule_for(ctx.table, ctx.field) {
            return Some(rule);
        }
        if self.auto_create {
            let rule = SequenceRule::default();
            self.rules.record_auto_rule(ctx.table, ctx.field, &rule);
            tracing::debug!(
                table = ctx.table,
                field = ctx.field,
                "auto-created default sequence rule"
            );
            return Some(rule);
        }
        None
    }

    fn state_key(rule: &SequenceRule, ctx: &AllocationContext<'_>) -> String {
        let sequence_key = ctx.sequence_key();
        if rule.is_daily() {
            format!("{sequence_key}::{}", rule.date_tag(ctx.today))
        } else {
            sequence_key
        }
    }

    fn next_for(entry: Option<&SequenceEntry>, rule: &SequenceRule) -> i64 {
        match entry {
            Some(entry) if entry.last >= rule.start => entry.last + 1,
            _ => rule.start,
        }
    }

    /// Allocates the next value. Returns `None` when no rule applies.
    pub fn next_value(&self, ctx: &AllocationContext<'_>) -> EngineResult<Option<Allocation>> {
        let Some(rule) = self.resolve_rule(ctx) else {
            return Ok(None);
        };
        let state_key = Self::state_key(&rule, ctx);

        let mut cache = self.cache.lock();
        let state = self.branch_state(&mut cache, ctx.branch_id)?;
        let next = Self::next_for(state.get(&state_key), &rule);
        state.insert(
            state_key.clone(),
            SequenceEntry {
                last: next,
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        self.persistence.store(ctx.branch_id, state)?;

        Ok(Some(Allocation {
            value: next,
            formatted: rule.format_value(next, ctx.today),
            sequence_key: ctx.sequence_key(),
            state_key,
            rule,
        }))
    }

    /// Projects the next value without moving the counter.
    pub fn preview_next_value(
        &self,
        ctx: &AllocationContext<'_>,
    ) -> EngineResult<Option<Allocation>> {
        let Some(rule) = self.resolve_rule(ctx) else {
            return Ok(None);
        };
        let state_key = Self::state_key(&rule, ctx);

        let mut cache = self.cache.lock();
        let state = self.branch_state(&mut cache, ctx.branch_id)?;
        let next = Self::next_for(state.get(&state_key), &rule);

        Ok(Some(Allocation {
            value: next,
            formatted: rule.format_value(next, ctx.today),
            sequence_key: ctx.sequence_key(),
            state_key,
            rule,
        }))
    }

    /// Raises the persisted counter to at least `observed`.
    ///
    /// Returns true when the counter moved. Used by the repair path when
    /// existing rows prove the counter fell behind.
    pub fn raise_floor(
        &self,
        ctx: &AllocationContext<'_>,
        observed: i64,
    ) -> EngineResult<bool> {
        let Some(rule) = self.resolve_rule(ctx) else {
            return Ok(false);
        };
        let state_key = Self::state_key(&rule, ctx);

        let mut cache = self.cache.lock();
        let state = self.branch_state(&mut cache, ctx.branch_id)?;
        let current = state.get(&state_key).map(|e| e.last).unwrap_or(0);
        if observed <= current {
            return Ok(false);
        }
        state.insert(
            state_key.clone(),
            SequenceEntry {
                last: observed,
                updated_at: Utc::now().to_rfc3339(),
            },
        );
        self.persistence.store(ctx.branch_id, state)?;
        tracing::info!(
            branch_id = ctx.branch_id,
            state_key,
            from = current,
            to = observed,
            "raised sequence counter from existing rows"
        );
        Ok(true)
    }

    /// Fills every ruled field of a record that is absent or blank.
    ///
    /// Each filled field gets its formatted value; when the rule names a
    /// `counter_field`, the raw counter lands there too. Fields already
    /// carrying a non-blank value are left alone.
    pub fn apply_auto_sequences(
        &self,
        ctx: &AllocationContext<'_>,
        record: &mut serde_json::Value,
    ) -> EngineResult<()> {
        let Some(obj) = record.as_object_mut() else {
            return Ok(());
        };
        for (field, _) in self.rules.rules_for_table(ctx.table) {
            let blank = match obj.get(&field) {
                None | Some(serde_json::Value::Null) => true,
                Some(serde_json::Value::String(s)) => s.trim().is_empty(),
                Some(_) => false,
            };
            if !blank {
                continue;
            }
            let field_ctx = AllocationContext {
                branch_id: ctx.branch_id,
                module_id: ctx.module_id,
                table: ctx.table,
                field: field.as_str(),
                today: ctx.today,
            };
            if let Some(allocation) = self.next_value(&field_ctx)? {
                obj.insert(
                    field.clone(),
                    serde_json::Value::String(allocation.formatted),
                );
                if let Some(counter_field) = allocation.rule.counter_field.as_deref() {
                    obj.insert(
                        counter_field.to_string(),
                        serde_json::Value::from(allocation.value),
                    );
                }
            }
        }
        Ok(())
    }

    /// Serves one wire-level sequence request.
    ///
    /// `preview` requests project the next value without consuming it.
    pub fn handle_request(
        &self,
        branch_id: &str,
        module_id: Option<&str>,
        request: &SequenceRequest,
    ) -> EngineResult<Option<Allocation>> {
        let mut ctx = AllocationContext::new(branch_id, &request.table, &request.field);
        ctx.module_id = module_id;
        if request.preview {
            self.preview_next_value(&ctx)
        } else {
            self.next_value(&ctx)
        }
    }

    fn branch_state<'s>(
        &self,
        cache: &'s mut HashMap<String, BranchSequenceState>,
        branch_id: &str,
    ) -> EngineResult<&'s mut BranchSequenceState> {
        match cache.entry(branch_id.to_string()) {
            std::collections::hash_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
            std::collections::hash_map::Entry::Vacant(entry) => {
                let loaded = self.persistence.load(branch_id)?;
                Ok(entry.insert(loaded))
            }
        }
    }
}

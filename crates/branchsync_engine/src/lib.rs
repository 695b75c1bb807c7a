//! # BranchSync Engine
//!
//! The incremental synchronization and concurrency control core.
//!
//! This crate provides:
//! - Insert-only delta computation over client cursors
//! - The sync session orchestrator (per-table aggregation, snapshot
//!   markers, wire response assembly)
//! - The concurrency guard evaluator for write requests
//! - The sequence allocator with data-driven collision repair
//! - The order aggregate mutation orchestrator with in-flight locking
//!
//! ## Key invariants
//!
//! - Deltas are insert-only: appended rows are reported, in-place
//!   mutations and deletions are not; staleness is handled by forcing a
//!   full resync instead
//! - At most one mutation per aggregate key is in flight at a time;
//!   concurrent duplicates fail fast rather than queue
//! - Allocated sequence values are verified against existing rows before
//!   acceptance; collisions trigger repair and bounded retry
//! - No error on the write path is silently swallowed

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delta;
mod error;
mod extract;
mod guard;
mod locks;
mod order;
mod sequence;
mod session;

pub use delta::compute_insert_only_delta;
pub use error::{EngineError, EngineResult};
pub use extract::{
    extract_payment_state, extract_updated_at, nested_find, resolve_timestamp, FieldProbe,
};
pub use guard::{evaluate_concurrency_guards, find_record_using_value, GuardOutcome, MarkerContext};
pub use locks::{InFlightGuard, InFlightLocks};
pub use order::{
    fetch_order_snapshot, is_draft_order_id, OrderOrchestrator, SavedOrder, TABLE_ORDER_HEADER,
    TABLE_ORDER_LINE, TABLE_ORDER_LINE_STATUS_LOG, TABLE_ORDER_PAYMENT, TABLE_ORDER_STATUS_LOG,
};
pub use sequence::{
    allocate_with_retry, audit_and_repair, build_sequence_key, extract_sequence_from_id,
    Allocation, AllocationContext, BranchSequenceState, DatePosition, FileStatePersistence,
    MemoryStatePersistence, ResetPolicy, RetryPolicy, RuleSource, SequenceAllocator,
    SequenceEntry, SequenceRule, SequenceStatePersistence, StaticRules,
};
pub use session::{
    resolve_server_snapshot_marker, SessionConfig, SessionOrchestrator, SessionRegistry,
    SessionState,
};

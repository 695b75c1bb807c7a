//! # BranchSync Protocol
//!
//! Wire types and the record cursor codec for BranchSync.
//!
//! This crate provides:
//! - `RecordRef` for canonical record references and cursors
//! - Cursor input normalization for heterogeneous identifier schemes
//! - Sync request/response messages
//! - Mutation requests, guard contexts, and conflict codes
//! - Per-table delta results
//!
//! This is a pure protocol crate with no I/O operations. Tables in this
//! domain use inconsistent identifier conventions (UUID primary keys,
//! legacy numeric ids, composite keys); normalizing early lets every
//! downstream component reason about "a cursor" uniformly.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod delta;
mod guard;
mod messages;
mod reference;

pub use delta::{DeltaOutcome, TableStats};
pub use guard::{Conflict, ConflictCode, ExpectedProperties, GuardContext};
pub use messages::{
    MutationRequest, MutationResponse, SequenceRequest, SyncRequest, SyncResponse, TableSelector,
};
pub use reference::{normalize_cursor_input, NormalizedCursor, RecordRef};

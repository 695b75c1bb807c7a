//! # BranchSync Store
//!
//! The record store interface consumed by the sync and mutation core.
//!
//! This crate provides:
//! - `TableStore`, the trait through which the core reads and writes
//!   table rows without knowing how they are persisted
//! - `MemoryStore`, a thread-safe in-memory implementation for embedding
//!   and tests
//! - Event metadata types backing snapshot-marker resolution
//!
//! Rows are `serde_json::Value` objects: upstream systems submit
//! heterogeneous shapes and the core must tolerate all of them.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod meta;
mod table;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use meta::EventMeta;
pub use table::{SaveOutcome, TableStore};

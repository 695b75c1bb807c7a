//! Error types for the sync and mutation core.

use branchsync_protocol::{Conflict, ConflictCode};
use branchsync_store::StoreError;
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the sync and mutation core.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A concurrency guard rejected the write.
    #[error("write rejected: {}", conflict.code)]
    Conflict {
        /// Structured conflict detail.
        conflict: Conflict,
        /// Whether the client must resync before retrying.
        requires_full_sync: bool,
    },

    /// Another mutation for the same aggregate key is in flight.
    #[error("duplicate save in flight for key {key}")]
    DuplicateInFlight {
        /// The contended aggregate key.
        key: String,
    },

    /// Resubmission of an aggregate at an already-stored version.
    #[error("duplicate submission of {id} at version {version}")]
    DuplicateVersion {
        /// Aggregate id.
        id: String,
        /// The already-stored version.
        version: u64,
    },

    /// An allocated sequence value collided with an existing row even
    /// after repair retries.
    #[error("sequence collision: {formatted} already exists after {attempts} attempts")]
    SequenceCollision {
        /// The colliding formatted value.
        formatted: String,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// No sequence rule configured for the field.
    #[error("no sequence rule for {table}.{field}")]
    MissingRule {
        /// Target table.
        table: String,
        /// Sequence-bearing field.
        field: String,
    },

    /// An aggregate write would leave zero child lines.
    #[error("aggregate must contain at least one line")]
    EmptyAggregate,

    /// The aggregate payload cannot be processed.
    #[error("invalid aggregate payload: {0}")]
    InvalidPayload(String),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Returns the structured conflict this error surfaces as, if any.
    ///
    /// Store version conflicts are translated here so every rejection
    /// reaches the client as one of the distinguishable conflict kinds.
    pub fn as_conflict(&self) -> Option<Conflict> {
        match self {
            EngineError::Conflict { conflict, .. } => Some(conflict.clone()),
            EngineError::Store(StoreError::VersionConflict {
                table,
                key,
                expected,
                current,
            }) => Some(
                Conflict::new(ConflictCode::VersionConflict, "record version mismatch")
                    .with_table(table.clone())
                    .with_values(expected.to_string(), current.to_string()),
            ),
            _ => None,
        }
    }

    /// Returns true when the client should fully resync before retrying.
    pub fn requires_full_sync(&self) -> bool {
        matches!(
            self,
            EngineError::Conflict {
                requires_full_sync: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_version_conflict_translates() {
        let err = EngineError::Store(StoreError::VersionConflict {
            table: "order_header".into(),
            key: "O1".into(),
            expected: 2,
            current: 5,
        });
        let conflict = err.as_conflict().unwrap();
        assert_eq!(conflict.code, ConflictCode::VersionConflict);
        assert_eq!(conflict.expected.as_deref(), Some("2"));
        assert_eq!(conflict.actual.as_deref(), Some("5"));
    }

    #[test]
    fn guard_conflict_passthrough() {
        let err = EngineError::Conflict {
            conflict: Conflict::new(ConflictCode::StaleUpdate, "stale"),
            requires_full_sync: false,
        };
        assert_eq!(err.as_conflict().unwrap().code, ConflictCode::StaleUpdate);
        assert!(!err.requires_full_sync());
    }
}

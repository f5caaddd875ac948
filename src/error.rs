use thiserror::Error;

use crate::record::RecordId;

/// Failure reported by an [`OutboxStore`](crate::OutboxStore) adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A shared lock around the storage was poisoned by a panicking thread.
    #[error("outbox store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// The stored version no longer matches the one the caller read.
    #[error("concurrent write detected for outbox record {id} (expected version {expected}, got {actual})")]
    VersionConflict {
        id: RecordId,
        expected: u64,
        actual: u64,
    },

    /// Another open transaction already staged a change to this record.
    #[error("outbox record {0} is locked by another transaction")]
    RowLocked(RecordId),

    /// The store stayed busy for longer than its lock timeout.
    #[error("outbox store busy, gave up after {0:?}")]
    Busy(std::time::Duration),

    /// The record to update does not exist (deleted or never inserted).
    #[error("outbox record {0} not found")]
    NotFound(RecordId),

    /// A stored row could not be mapped back to an outbox record.
    #[error("invalid outbox row: {0}")]
    InvalidData(String),

    /// The backing database rejected the operation.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Whether this error only concerns one record and the caller may skip it.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::VersionConflict { .. } | StoreError::RowLocked(_)
        )
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of the durable write path. Either variant must abort the
/// caller's business transaction.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("failed to serialize {event_type} to JSON: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

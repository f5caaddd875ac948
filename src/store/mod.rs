//! Persistence of outbox records.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ OutboxStore                                                  │
//! │  begin() ──▶ OutboxTransaction                               │
//! │               insert / fetch_pending / update / commit       │
//! │  delete_older_than()      (own transaction, sweeper only)    │
//! │  find_by_aggregate() / count_by_status()   (operational)     │
//! └──────────────────────────────────────────────────────────────┘
//!          │                               │
//!          ▼                               ▼
//! ┌──────────────────────┐      ┌───────────────────────────────┐
//! │ InMemoryOutboxStore  │      │ SqliteOutboxStore (`sqlite`)  │
//! └──────────────────────┘      └───────────────────────────────┘
//! ```
//!
//! Dropping a transaction without calling [`OutboxTransaction::commit`]
//! rolls it back. The writer, drainer and business code all act through the
//! same transaction handle, which is what makes the outbox insert atomic
//! with the business mutation.

mod in_memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::record::{NewOutboxRecord, OutboxRecord, OutboxStatus, RecordId};

pub use in_memory::{InMemoryOutboxStore, InMemoryTransaction};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteOutboxStore, SqliteTransaction, DEFAULT_LOCK_TIMEOUT, OUTBOX_SCHEMA};

/// An open unit of work against the outbox table.
pub trait OutboxTransaction {
    /// Append a PENDING record and return its id.
    fn insert(&mut self, record: NewOutboxRecord) -> StoreResult<RecordId>;

    /// Up to `limit` PENDING records, oldest `created_at` first (ties by id).
    fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<OutboxRecord>>;

    /// Persist `record`'s mutable fields if the stored version still equals
    /// `expected_version`. Returns the new version.
    ///
    /// Fails with [`StoreError::VersionConflict`](crate::StoreError::VersionConflict)
    /// when another writer got there first, or with
    /// [`StoreError::RowLocked`](crate::StoreError::RowLocked) when another
    /// open transaction holds the record. Either way the caller skips it.
    fn update(&mut self, record: &OutboxRecord, expected_version: u64) -> StoreResult<u64>;

    fn commit(self) -> StoreResult<()>;

    /// Explicit rollback; dropping the transaction has the same effect.
    fn rollback(self) -> StoreResult<()>
    where
        Self: Sized,
    {
        drop(self);
        Ok(())
    }
}

/// A transactional store holding outbox records.
pub trait OutboxStore: Send + Sync {
    type Transaction<'a>: OutboxTransaction
    where
        Self: 'a;

    fn begin(&self) -> StoreResult<Self::Transaction<'_>>;

    /// Delete records in `status` whose `sent_at` is strictly before `cutoff`.
    /// Runs in its own transaction and returns the number removed.
    fn delete_older_than(&self, status: OutboxStatus, cutoff: DateTime<Utc>) -> StoreResult<usize>;

    /// All records of one aggregate, oldest first.
    fn find_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> StoreResult<Vec<OutboxRecord>>;

    fn count_by_status(&self, status: OutboxStatus) -> StoreResult<usize>;
}

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::StoreResult;
use crate::record::OutboxStatus;
use crate::store::OutboxStore;

pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Deletes SENT records once they are older than the retention window.
/// PENDING, PROCESSING and FAILED records are never touched.
pub struct RetentionSweeper<S> {
    store: Arc<S>,
    retention: Duration,
}

impl<S> RetentionSweeper<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retention: Duration::days(DEFAULT_RETENTION_DAYS),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }
}

impl<S: OutboxStore> RetentionSweeper<S> {
    pub fn sweep(&self) -> StoreResult<usize> {
        self.sweep_at(Utc::now())
    }

    /// Delete SENT records whose `sent_at` is before `now - retention`.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = now - self.retention;
        let deleted = self.store.delete_older_than(OutboxStatus::Sent, cutoff)?;
        if deleted > 0 {
            info!(count = deleted, %cutoff, "Cleaned up {} old outbox events", deleted);
        }
        Ok(deleted)
    }
}

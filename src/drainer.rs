//! Batch engine that turns PENDING records into broker publications.
//!
//! One drain is one store transaction:
//!
//! 1. fetch up to `batch_size` PENDING records, oldest first
//! 2. for each: claim, publish keyed by aggregate id, apply the outcome
//! 3. persist each new snapshot with a version check, then commit
//!
//! A publish failure only affects its record. A version conflict skips the
//! record for this cycle. Any other store failure aborts the batch and the
//! transaction rolls back, so the next tick retries it from scratch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, PublishError};
use crate::error::{StoreError, StoreResult};
use crate::record::{OutboxRecord, OutboxStatus, RecordEvent};
use crate::store::{OutboxStore, OutboxTransaction};

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_RETRY: u32 = 5;
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a batch drain operation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainResult {
    pub fetched: usize,
    pub sent: usize,
    /// Failed but returned to PENDING for another attempt.
    pub requeued: usize,
    /// Parked in FAILED after exhausting retries.
    pub failed: usize,
    /// Skipped because another drainer changed the record first.
    pub conflicts: usize,
}

impl DrainResult {
    pub fn is_empty(&self) -> bool {
        self.fetched == 0
    }
}

enum Outcome {
    Sent,
    Requeued,
    Failed,
    Conflict,
}

/// Drains the outbox into a broker.
pub struct OutboxDrainer<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    batch_size: usize,
    max_retry: u32,
    publish_timeout: Duration,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S, B> OutboxDrainer<S, B> {
    pub fn new(store: Arc<S>, broker: Arc<B>) -> Self {
        Self {
            store,
            broker,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retry: DEFAULT_MAX_RETRY,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            running: AtomicBool::new(false),
        }
    }

    /// Set the batch size (max records to process per drain).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the number of failed publishes after which a record is parked.
    pub fn with_max_retry(mut self, max: u32) -> Self {
        self.max_retry = max;
        self
    }

    /// Set how long one publish may wait for the broker's acknowledgement.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether a drain is in progress right now.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl<S: OutboxStore, B: Broker> OutboxDrainer<S, B> {
    /// Run one batch.
    ///
    /// Returns `Ok(None)` without touching the store when another call is
    /// still in progress.
    pub fn drain(&self) -> StoreResult<Option<DrainResult>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Outbox drain already running, skipping");
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        self.drain_batch().map(Some)
    }

    fn drain_batch(&self) -> StoreResult<DrainResult> {
        let mut tx = self.store.begin()?;
        let batch = tx.fetch_pending(self.batch_size)?;
        let mut result = DrainResult {
            fetched: batch.len(),
            ..Default::default()
        };

        if batch.is_empty() {
            tx.commit()?;
            return Ok(result);
        }

        info!(count = batch.len(), "Processing {} pending outbox events", batch.len());

        for record in &batch {
            match self.process(&mut tx, record)? {
                Outcome::Sent => result.sent += 1,
                Outcome::Requeued => result.requeued += 1,
                Outcome::Failed => result.failed += 1,
                Outcome::Conflict => result.conflicts += 1,
            }
        }

        tx.commit()?;
        Ok(result)
    }

    fn process<T: OutboxTransaction>(
        &self,
        tx: &mut T,
        record: &OutboxRecord,
    ) -> StoreResult<Outcome> {
        let claimed = record
            .transition(RecordEvent::Claimed)
            .map_err(|err| StoreError::InvalidData(err.to_string()))?;

        let (next, outcome) = match self.publish(&claimed) {
            Ok(()) => {
                debug!(id = %record.id, topic = %record.topic, "Outbox event published");
                let next = claimed.transition(RecordEvent::Published { at: Utc::now() });
                (next, Outcome::Sent)
            }
            Err(err) => {
                let next = claimed.transition(RecordEvent::PublishFailed {
                    error: err.to_string(),
                    max_retry: self.max_retry,
                });
                let outcome = match &next {
                    Ok(next) if next.status == OutboxStatus::Failed => {
                        error!(
                            id = %record.id,
                            topic = %record.topic,
                            retry_count = next.retry_count,
                            error = %err,
                            "Outbox event failed permanently"
                        );
                        Outcome::Failed
                    }
                    Ok(next) => {
                        warn!(
                            id = %record.id,
                            topic = %record.topic,
                            retry_count = next.retry_count,
                            error = %err,
                            "Outbox publish failed, will retry"
                        );
                        Outcome::Requeued
                    }
                    // Surfaces as InvalidData below.
                    Err(_) => Outcome::Requeued,
                };
                (next, outcome)
            }
        };
        let next = next.map_err(|err| StoreError::InvalidData(err.to_string()))?;

        match tx.update(&next, record.version) {
            Ok(_) => Ok(outcome),
            Err(err) if err.is_conflict() => {
                warn!(id = %record.id, error = %err, "Outbox record changed concurrently, skipping");
                Ok(Outcome::Conflict)
            }
            Err(err) => Err(err),
        }
    }

    fn publish(&self, record: &OutboxRecord) -> Result<(), PublishError> {
        self.broker
            .send(&record.topic, &record.aggregate_id, record.payload.as_bytes())?
            .wait(self.publish_timeout)
    }
}

//! The durable outbox record and its state machine.
//!
//! ```text
//!            Claimed             Published
//! PENDING ───────────▶ PROCESSING ──────────▶ SENT
//!    ▲                     │
//!    │   PublishFailed     │ PublishFailed
//!    └─────(retries left)──┤ (retry_count >= max_retry)
//!                          ▼
//!                        FAILED
//! ```
//!
//! Transitions are pure: [`OutboxRecord::transition`] returns a new
//! snapshot and leaves the original untouched. Persisting the snapshot (and
//! bumping `version`) is the store's job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned identity of an outbox record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(OutboxStatus::Pending),
            "PROCESSING" => Some(OutboxStatus::Processing),
            "SENT" => Some(OutboxStatus::Sent),
            "FAILED" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }

    /// SENT and FAILED never move again on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Failed)
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as handed to [`OutboxTransaction::insert`](crate::OutboxTransaction::insert).
/// The store assigns the id and starts it at PENDING, retry 0, version 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewOutboxRecord {
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Durable domain event awaiting (or done with) broker publication.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: RecordId,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: String,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub version: u64,
}

/// Inputs to the record state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordEvent {
    /// A drainer picked the record up for publication.
    Claimed,
    /// The broker acknowledged the publication.
    Published { at: DateTime<Utc> },
    /// The publication failed; park the record once `max_retry` is reached.
    PublishFailed { error: String, max_retry: u32 },
}

impl RecordEvent {
    fn name(&self) -> &'static str {
        match self {
            RecordEvent::Claimed => "Claimed",
            RecordEvent::Published { .. } => "Published",
            RecordEvent::PublishFailed { .. } => "PublishFailed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("outbox record {id} cannot apply {event} while {from}")]
pub struct InvalidTransition {
    pub id: RecordId,
    pub from: OutboxStatus,
    pub event: &'static str,
}

impl OutboxRecord {
    pub fn from_new(id: RecordId, record: NewOutboxRecord) -> Self {
        Self {
            id,
            aggregate_type: record.aggregate_type,
            aggregate_id: record.aggregate_id,
            event_type: record.event_type,
            topic: record.topic,
            payload: record.payload,
            status: OutboxStatus::Pending,
            created_at: record.created_at,
            sent_at: None,
            retry_count: 0,
            last_error: None,
            version: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == OutboxStatus::Processing
    }

    pub fn is_sent(&self) -> bool {
        self.status == OutboxStatus::Sent
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutboxStatus::Failed
    }

    /// Apply `event` and return the resulting snapshot.
    pub fn transition(&self, event: RecordEvent) -> Result<OutboxRecord, InvalidTransition> {
        let mut next = self.clone();
        match (self.status, &event) {
            (OutboxStatus::Pending, RecordEvent::Claimed) => {
                next.status = OutboxStatus::Processing;
            }
            (OutboxStatus::Processing, RecordEvent::Published { at }) => {
                next.status = OutboxStatus::Sent;
                next.sent_at = Some(*at);
            }
            (OutboxStatus::Processing, RecordEvent::PublishFailed { error, max_retry }) => {
                next.retry_count = self.retry_count.saturating_add(1);
                next.last_error = Some(error.clone());
                next.status = if next.retry_count >= *max_retry {
                    OutboxStatus::Failed
                } else {
                    OutboxStatus::Pending
                };
            }
            _ => {
                return Err(InvalidTransition {
                    id: self.id,
                    from: self.status,
                    event: event.name(),
                })
            }
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> OutboxRecord {
        OutboxRecord::from_new(
            RecordId(1),
            NewOutboxRecord {
                aggregate_type: "Order".into(),
                aggregate_id: "42".into(),
                event_type: "OrderPaid".into(),
                topic: "market.order.paid".into(),
                payload: r#"{"orderId":42}"#.into(),
                created_at: Utc::now(),
            },
        )
    }

    fn failed_with(max_retry: u32) -> RecordEvent {
        RecordEvent::PublishFailed {
            error: "broker unavailable".into(),
            max_retry,
        }
    }

    #[test]
    fn new_record_is_pending() {
        let record = pending();
        assert!(record.is_pending());
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.version, 0);
        assert!(record.sent_at.is_none());
    }

    #[test]
    fn claim_then_publish_sets_sent_at() {
        let at = Utc::now();
        let record = pending();
        let processing = record.transition(RecordEvent::Claimed).unwrap();
        assert!(processing.is_processing());
        assert!(record.is_pending(), "transition must not mutate the input");

        let sent = processing.transition(RecordEvent::Published { at }).unwrap();
        assert!(sent.is_sent());
        assert_eq!(sent.sent_at, Some(at));
        assert_eq!(sent.retry_count, 0);
        assert_eq!(sent.version, record.version);
    }

    #[test]
    fn failure_requeues_until_the_cap() {
        let mut record = pending();
        for attempt in 1..5 {
            record = record
                .transition(RecordEvent::Claimed)
                .unwrap()
                .transition(failed_with(5))
                .unwrap();
            assert!(record.is_pending());
            assert_eq!(record.retry_count, attempt);
            assert_eq!(record.last_error.as_deref(), Some("broker unavailable"));
        }

        let parked = record
            .transition(RecordEvent::Claimed)
            .unwrap()
            .transition(failed_with(5))
            .unwrap();
        assert!(parked.is_failed());
        assert_eq!(parked.retry_count, 5);
        assert!(parked.sent_at.is_none());
    }

    #[test]
    fn terminal_states_reject_everything() {
        let failed = pending()
            .transition(RecordEvent::Claimed)
            .unwrap()
            .transition(failed_with(1))
            .unwrap();
        assert!(failed.status.is_terminal());

        let err = failed.transition(RecordEvent::Claimed).unwrap_err();
        assert_eq!(err.from, OutboxStatus::Failed);
        assert_eq!(err.event, "Claimed");

        let sent = pending()
            .transition(RecordEvent::Claimed)
            .unwrap()
            .transition(RecordEvent::Published { at: Utc::now() })
            .unwrap();
        assert!(sent.transition(failed_with(5)).is_err());
    }

    #[test]
    fn pending_cannot_skip_processing() {
        let err = pending()
            .transition(RecordEvent::Published { at: Utc::now() })
            .unwrap_err();
        assert_eq!(err.from, OutboxStatus::Pending);
        assert_eq!(err.event, "Published");
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Processing,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("sent"), None);
    }
}

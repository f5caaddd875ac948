use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::error::WriteError;
use crate::event::DomainEvent;
use crate::record::{NewOutboxRecord, RecordId};
use crate::registry::EventRegistry;
use crate::store::OutboxTransaction;

/// Records domain events in the outbox inside the caller's transaction.
///
/// The transaction is a required argument, so a write outside a business
/// transaction does not compile. Any error returned here must abort that
/// transaction; otherwise the business change commits without its event.
#[derive(Clone)]
pub struct OutboxWriter {
    registry: Arc<EventRegistry>,
}

impl OutboxWriter {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    /// Insert a PENDING record for `event`.
    ///
    /// Returns `Ok(None)` when the event type is not registered for durable
    /// delivery.
    pub fn write<E, T>(&self, event: &E, tx: &mut T) -> Result<Option<RecordId>, WriteError>
    where
        E: DomainEvent,
        T: OutboxTransaction,
    {
        if !self.registry.contains::<E>() {
            debug!(event_type = E::EVENT_TYPE, "No outbox mapping, skipping");
            return Ok(None);
        }

        let payload =
            serde_json::to_string(event).map_err(|source| WriteError::Serialization {
                event_type: E::EVENT_TYPE,
                source,
            })?;
        self.write_json(event, payload, tx)
    }

    /// Same as [`write`](Self::write) for a payload the caller already
    /// serialized from `event`.
    pub(crate) fn write_json<E, T>(
        &self,
        event: &E,
        payload: String,
        tx: &mut T,
    ) -> Result<Option<RecordId>, WriteError>
    where
        E: DomainEvent,
        T: OutboxTransaction,
    {
        let Some(metadata) = self.registry.resolve(event) else {
            debug!(event_type = E::EVENT_TYPE, "No outbox mapping, skipping");
            return Ok(None);
        };

        let id = tx.insert(NewOutboxRecord {
            aggregate_type: metadata.aggregate_type,
            aggregate_id: metadata.aggregate_id,
            event_type: E::EVENT_TYPE.to_string(),
            topic: metadata.topic,
            payload,
            created_at: Utc::now(),
        })?;

        debug!(%id, event_type = E::EVENT_TYPE, "Outbox record staged");
        Ok(Some(id))
    }
}

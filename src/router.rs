//! Routes a domain event to local listeners and to its broker path.
//!
//! Local listeners always run first, synchronously. Typed listeners see the
//! event itself, so they run even when the event cannot be encoded. JSON
//! listeners run once the payload is encoded. Then, depending on the
//! router's [`DeliveryMode`]:
//!
//! - `Durable`: the event is recorded in the outbox inside the caller's
//!   transaction and published later by the drainer. The event survives a
//!   crash right after the business commit.
//! - `Direct`: the event is sent to the broker straight away. This is
//!   weaker: it can be published for a business change that later rolls
//!   back, and a crash after the business commit loses it. Publish
//!   failures are logged and never reach the caller.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use event_emitter_rs::EventEmitter;
use thiserror::Error;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::config::OutboxConfig;
use crate::drainer::DEFAULT_PUBLISH_TIMEOUT;
use crate::error::WriteError;
use crate::event::DomainEvent;
use crate::record::RecordId;
use crate::store::OutboxTransaction;
use crate::writer::OutboxWriter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    Durable,
    #[default]
    Direct,
}

/// `outbox.enabled` picks the path: durable when set, direct otherwise.
impl From<&OutboxConfig> for DeliveryMode {
    fn from(config: &OutboxConfig) -> Self {
        if config.enabled {
            DeliveryMode::Durable
        } else {
            DeliveryMode::Direct
        }
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("failed to serialize {event_type} to JSON: {source}")]
    Serialization {
        event_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Write(#[from] WriteError),
}

type TypedListener = Arc<dyn Fn(&dyn Any) + Send + Sync>;

/// In-process listeners. JSON listeners are keyed by event type tag and
/// receive the encoded payload; typed listeners are keyed by Rust type and
/// receive a reference to the event.
pub struct LocalListeners {
    emitter: Mutex<EventEmitter>,
    typed: RwLock<HashMap<TypeId, Vec<TypedListener>>>,
}

impl Default for LocalListeners {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalListeners {
    pub fn new() -> Self {
        Self {
            emitter: Mutex::new(EventEmitter::new()),
            typed: RwLock::new(HashMap::new()),
        }
    }

    /// Register a listener that receives the event value itself.
    pub fn on_event<E, F>(&self, listener: F)
    where
        E: DomainEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        let listener: TypedListener = Arc::new(move |event: &dyn Any| {
            if let Some(event) = event.downcast_ref::<E>() {
                listener(event);
            }
        });
        self.typed
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(TypeId::of::<E>())
            .or_default()
            .push(listener);
    }

    /// Run every typed listener for `E` on the calling thread.
    pub fn notify_event<E: DomainEvent>(&self, event: &E) {
        let listeners = self
            .typed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<E>())
            .cloned()
            .unwrap_or_default();

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event as &dyn Any))).is_err() {
                warn!(event_type = E::EVENT_TYPE, "Local listener panicked");
            }
        }
    }

    /// Register a listener and return its id.
    pub fn on<F>(&self, event_type: &str, listener: F) -> String
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.emitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .on(event_type, listener)
    }

    /// Deliver `payload` to every listener of `event_type` and wait for all
    /// of them. A panicking listener is logged and does not affect the rest.
    pub fn notify(&self, event_type: &str, payload: &str) {
        let handles = self
            .emitter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .emit(event_type, payload.to_string());

        for handle in handles {
            if handle.join().is_err() {
                warn!(event_type, "Local listener panicked");
            }
        }
    }
}

pub struct EventRouter<B> {
    listeners: LocalListeners,
    writer: OutboxWriter,
    broker: Arc<B>,
    mode: DeliveryMode,
    publish_timeout: Duration,
}

impl<B: Broker> EventRouter<B> {
    pub fn new(writer: OutboxWriter, broker: Arc<B>, mode: DeliveryMode) -> Self {
        Self {
            listeners: LocalListeners::new(),
            writer,
            broker,
            mode,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Mode from `outbox.enabled`, direct publish timeout from the poller.
    pub fn from_config(config: &OutboxConfig, writer: OutboxWriter, broker: Arc<B>) -> Self {
        Self::new(writer, broker, DeliveryMode::from(config))
            .with_publish_timeout(config.publish_timeout())
    }

    /// Bound on the broker acknowledgement wait in `Direct` mode.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn listeners(&self) -> &LocalListeners {
        &self.listeners
    }

    /// Register a local listener for events tagged `event_type`.
    pub fn on<F>(&self, event_type: &str, listener: F) -> String
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.listeners.on(event_type, listener)
    }

    /// Register a local listener that receives the event value.
    pub fn on_event<E, F>(&self, listener: F)
    where
        E: DomainEvent,
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.listeners.on_event(listener)
    }

    /// Notify local listeners, then hand the event to the delivery path.
    ///
    /// Typed listeners run before the event is encoded, so they are notified
    /// even when encoding fails. JSON listeners need the payload and are
    /// skipped in that case.
    ///
    /// In `Durable` mode an error means the outbox record was not staged and
    /// the caller must roll `tx` back. Returns the staged record id, if any.
    pub fn publish<E, T>(&self, event: &E, tx: &mut T) -> Result<Option<RecordId>, RouterError>
    where
        E: DomainEvent,
        T: OutboxTransaction,
    {
        self.listeners.notify_event(event);

        let payload = serde_json::to_string(event).map_err(|source| RouterError::Serialization {
            event_type: E::EVENT_TYPE,
            source,
        })?;

        self.listeners.notify(E::EVENT_TYPE, &payload);

        match self.mode {
            DeliveryMode::Durable => Ok(self.writer.write_json(event, payload, tx)?),
            DeliveryMode::Direct => {
                self.send_direct(event, &payload);
                Ok(None)
            }
        }
    }

    fn send_direct<E: DomainEvent>(&self, event: &E, payload: &str) {
        let Some(metadata) = self.writer.registry().resolve(event) else {
            debug!(event_type = E::EVENT_TYPE, "No broker mapping, skipping direct publish");
            return;
        };

        let result = self
            .broker
            .send(&metadata.topic, &metadata.aggregate_id, payload.as_bytes())
            .and_then(|delivery| delivery.wait(self.publish_timeout));

        match result {
            Ok(()) => debug!(topic = %metadata.topic, "Event published directly"),
            Err(err) => warn!(
                topic = %metadata.topic,
                event_type = E::EVENT_TYPE,
                error = %err,
                "Direct publish failed, event dropped"
            ),
        }
    }
}

//! Transactional outbox: record domain events atomically with the business
//! change that produced them, then relay them to a message broker.
//!
//! ```text
//! caller ──▶ EventRouter ──▶ local listeners
//!                 │
//!                 └──▶ OutboxWriter ──(caller's tx)──▶ OutboxStore
//!                                                          │
//!                 Broker ◀── OutboxDrainer ◀───────────────┤
//!                                                          │
//!                            RetentionSweeper ─────────────┘
//! ```

pub mod broker;
pub mod config;
mod drainer;
mod error;
mod event;
mod record;
mod registry;
pub mod relay;
mod router;
pub mod schedule;
pub mod store;
mod sweeper;
pub mod telemetry;
mod writer;

pub use broker::{Broker, BrokerMessage, Delivery, InMemoryBroker, LogBroker, PublishError};
pub use config::{ConfigError, OutboxConfig};
pub use drainer::{DrainResult, OutboxDrainer};
pub use error::{StoreError, StoreResult, WriteError};
pub use event::DomainEvent;
pub use record::{
    InvalidTransition, NewOutboxRecord, OutboxRecord, OutboxStatus, RecordEvent, RecordId,
};
pub use registry::{EventMetadata, EventRegistry, RegistryError};
pub use relay::{OutboxRelay, RelayError};
pub use router::{DeliveryMode, EventRouter, LocalListeners, RouterError};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxTransaction};
#[cfg(feature = "sqlite")]
pub use store::SqliteOutboxStore;
pub use sweeper::RetentionSweeper;
pub use writer::OutboxWriter;

// Re-export the EventEmitter from the event_emitter_rs crate
pub use event_emitter_rs::EventEmitter;

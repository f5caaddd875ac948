//! Message broker abstraction used by the drainer and the direct path.
//!
//! A broker accepts a message and hands back a [`Delivery`], the promise of
//! an acknowledgement. The caller decides how long to wait for it:
//!
//! ```ignore
//! let delivery = broker.send("market.order.paid", "42", payload.as_bytes())?;
//! delivery.wait(Duration::from_secs(10))?;
//! ```
//!
//! Waiting past the timeout abandons the delivery locally; the broker may
//! still complete it later, which is why consumers must be idempotent.

mod in_memory;
mod log;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use in_memory::{BrokerMessage, InMemoryBroker};
pub use log::LogBroker;

/// Error type for publish operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Connection to the broker failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// The broker rejected the message
    #[error("message rejected: {0}")]
    Rejected(String),
    /// No acknowledgement within the caller's timeout
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    /// The broker dropped the delivery without completing it
    #[error("delivery abandoned by broker")]
    Abandoned,
    #[error("publish error: {0}")]
    Other(String),
}

/// Transport that publishes keyed messages to topics.
///
/// The key is the aggregate id, so brokers that partition by key keep the
/// events of one aggregate in order.
pub trait Broker: Send + Sync {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, PublishError>;
}

impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, PublishError> {
        (**self).send(topic, key, payload)
    }
}

enum DeliveryState {
    Ready(Result<(), PublishError>),
    Pending(Receiver<Result<(), PublishError>>),
}

/// Pending acknowledgement of one published message.
pub struct Delivery {
    state: DeliveryState,
}

impl Delivery {
    /// A delivery the broker already confirmed.
    pub fn acknowledged() -> Self {
        Self {
            state: DeliveryState::Ready(Ok(())),
        }
    }

    /// A delivery the broker already refused.
    pub fn failed(error: PublishError) -> Self {
        Self {
            state: DeliveryState::Ready(Err(error)),
        }
    }

    /// A delivery completed later through the returned [`DeliveryHandle`],
    /// typically from the transport's I/O thread.
    pub fn pending() -> (DeliveryHandle, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            DeliveryHandle { tx },
            Self {
                state: DeliveryState::Pending(rx),
            },
        )
    }

    /// Block until the broker acknowledges, fails, or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<(), PublishError> {
        match self.state {
            DeliveryState::Ready(result) => result,
            DeliveryState::Pending(rx) => match rx.recv_timeout(timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(PublishError::Timeout(timeout)),
                Err(RecvTimeoutError::Disconnected) => Err(PublishError::Abandoned),
            },
        }
    }
}

/// Completion side of a [`Delivery::pending`] pair. Dropping it without
/// completing resolves the delivery as [`PublishError::Abandoned`].
pub struct DeliveryHandle {
    tx: SyncSender<Result<(), PublishError>>,
}

impl DeliveryHandle {
    pub fn complete(self, result: Result<(), PublishError>) {
        // The waiter may have timed out and gone away.
        let _ = self.tx.send(result);
    }
}

use std::sync::{Arc, PoisonError, RwLock};

use super::{Broker, Delivery, PublishError};

/// A message as the broker received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// In-memory broker for tests and single-process setups.
///
/// Every send is acknowledged immediately and appended to a shared log.
/// Clones share the same log.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    log: Arc<RwLock<Vec<BrokerMessage>>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages in send order.
    pub fn messages(&self) -> Vec<BrokerMessage> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages published to `topic`, in send order.
    pub fn messages_on(&self, topic: &str) -> Vec<BrokerMessage> {
        self.log
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.log
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl Broker for InMemoryBroker {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, PublishError> {
        let mut log = self
            .log
            .write()
            .map_err(|_| PublishError::ConnectionFailed("in-memory broker poisoned".into()))?;
        log.push(BrokerMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(Delivery::acknowledged())
    }
}

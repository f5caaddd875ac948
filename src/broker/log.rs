use std::sync::{Arc, Mutex};

use tracing::info;

use super::{Broker, Delivery, PublishError};

/// A broker that only logs what it would publish, optionally into a buffer.
#[derive(Default)]
pub struct LogBroker {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogBroker {
    pub fn new() -> Self {
        LogBroker { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogBroker {
            buffer: Some(buffer),
        }
    }
}

impl Broker for LogBroker {
    fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, PublishError> {
        let payload = String::from_utf8_lossy(payload);
        info!(topic, key, payload = %payload, "Outbox publish");
        if let Some(buffer) = &self.buffer {
            let mut buffer = buffer
                .lock()
                .map_err(|_| PublishError::Other("log broker buffer poisoned".into()))?;
            buffer.push(format!("[OUTBOX] {topic} {key} {payload}"));
        }
        Ok(Delivery::acknowledged())
    }
}

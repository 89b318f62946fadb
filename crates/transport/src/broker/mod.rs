//! Broker abstraction.
//!
//! The communication layer assumes an external queue-oriented broker that
//! offers named and temporary queues, enqueue with a broker-assigned message
//! id, blocking dequeue and a correlation-id field. These traits capture
//! exactly that surface; [`memory`] provides an in-process implementation.
//!
//! Sessions are shared between threads (`Arc<dyn BrokerSession>`), so every
//! method takes `&self`.

pub mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use corelib::Result;

pub use memory::{MemoryBroker, MemoryBrokerRegistry};

/// A message as seen by the broker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Assigned by the broker on send; `None` before that.
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            ..Self::default()
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Opens connections to broker addresses.
pub trait BrokerConnector: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>>;
}

/// An open broker connection. Temporary queues belong to the connection that
/// created them and disappear when it closes.
pub trait BrokerConnection: Send + Sync {
    fn create_session(&self) -> Result<Arc<dyn BrokerSession>>;

    /// Close the connection, its sessions and its temporary queues.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

pub trait BrokerSession: Send + Sync {
    /// Create a temporary queue with a broker-assigned name.
    fn create_temporary_queue(&self) -> Result<String>;

    fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Enqueue `message` and return the broker-assigned message id.
    fn send(&self, queue: &str, message: BrokerMessage) -> Result<String>;

    /// Block until a message arrives.
    ///
    /// Returns `Ok(None)` at end-of-stream (session closed or queue
    /// deleted).
    fn receive(&self, queue: &str) -> Result<Option<BrokerMessage>>;

    /// Like [`BrokerSession::receive`] with a deadline. Returns `Ok(None)`
    /// on timeout and an error at end-of-stream.
    fn receive_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>>;

    fn close(&self);
}

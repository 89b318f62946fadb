//! Channel transport over a queue-oriented broker.
//!
//! Turns one-way broker queues into logical duplex channels between nodes:
//! - [`broker`]: the broker surface the layer relies on, plus an in-memory broker
//! - [`negotiation`]: the duplex queue negotiation token
//! - [`handshake`] / [`provider`]: active and passive channel establishment
//! - [`consumer`]: the generic single-threaded queue receive loop
//! - [`correlator`] / [`request_dispatch`]: request/response matching and inbound dispatch
//! - [`channel`]: the channel model with its forward-only state machine

pub mod broker;
pub mod channel;
pub mod connection_pool;
pub mod consumer;
pub mod correlator;
pub mod endpoint;
pub mod handshake;
pub mod negotiation;
pub mod protocol;
pub mod provider;
pub mod request_dispatch;

pub use broker::{BrokerConnector, MemoryBroker, MemoryBrokerRegistry};
pub use channel::{ChannelDirection, ChannelQueues, ChannelState, MessageChannel};
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use consumer::{ConsumerState, MessageHandler, QueueConsumer};
pub use correlator::{await_response, ResponseCallback, ResponseCorrelator};
pub use endpoint::{BrokenChannelListener, ChannelEndpointHandler};
pub use provider::{ServerHandle, TransportProvider};

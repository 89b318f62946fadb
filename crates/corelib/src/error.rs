//! Error types for the communication layer.
//!
//! Handshake and connect failures surface synchronously through [`Error`].
//! Steady-state request failures never do; they travel back to the caller as
//! a non-success [`crate::message::NetworkResponse`] instead.

use thiserror::Error as ThisError;

/// Result type alias for the communication layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the communication layer.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum Error {
    /// Protocol version mismatch, malformed handshake or negotiation token
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Broker I/O failure or refused connection
    #[error("Transport error: {0}")]
    Transport(String),
    /// No response within the deadline
    #[error("Timeout: {0}")]
    Timeout(String),
    /// Channel closed or broken while the operation was outstanding
    #[error("Channel state error: {0}")]
    ChannelState(String),
    /// No route while forwarding
    #[error("Routing error: {0}")]
    Routing(String),
    /// Internal invariant violation (e.g. duplicate registration)
    #[error("Consistency error: {0}")]
    Consistency(String),
    /// Payload or metadata could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for errors that indicate the underlying broker link is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

//! Request/response envelopes exchanged over channels.
//!
//! The communication layer carries opaque payload bytes; it only interprets
//! the metadata needed for routing (sender, final recipient) and the result
//! code of responses.

pub mod factory;
pub mod metadata;
pub mod request;
pub mod response;
pub mod result_code;

pub use metadata::MessageMetadata;
pub use request::NetworkRequest;
pub use response::NetworkResponse;
pub use result_code::ResultCode;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Application message type of the built-in channel health check.
pub const MESSAGE_TYPE_HEALTH_CHECK: &str = "healthCheck";

/// Serialize a payload value into content bytes.
pub fn serialize_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize content bytes produced by [`serialize_payload`].
pub fn deserialize_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

//! Network request envelope.

use crate::message::metadata::MessageMetadata;
use crate::node::NodeId;

/// A request sent over a channel.
///
/// The `request_id` is application level and survives forwarding; the
/// broker-level correlation id is assigned by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkRequest {
    request_id: String,
    message_type: String,
    content: Vec<u8>,
    metadata: MessageMetadata,
}

impl NetworkRequest {
    /// Create a request with a fresh request id.
    pub fn new(message_type: impl Into<String>, content: Vec<u8>, sender: NodeId, final_recipient: Option<NodeId>) -> Self {
        let mut metadata = MessageMetadata::new();
        metadata.set_sender(sender);
        if let Some(recipient) = final_recipient {
            metadata.set_final_recipient(recipient);
        }
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            content,
            metadata,
        }
    }

    /// Rebuild a request from its wire parts.
    pub fn from_parts(request_id: String, message_type: String, content: Vec<u8>, metadata: MessageMetadata) -> Self {
        Self {
            request_id,
            message_type,
            content,
            metadata,
        }
    }

    /// Copy of this request for forwarding by a relay. The request id is
    /// kept; the hop count is incremented.
    pub fn for_forwarding(&self) -> Self {
        let mut forwarded = self.clone();
        forwarded.metadata.increment_hop_count();
        forwarded
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MessageMetadata {
        &mut self.metadata
    }
}

//! Wire format.
//!
//! Envelopes map onto broker messages as follows: the message type, protocol
//! version, metadata, result code, negotiation token and channel ids travel
//! as string properties; payload bytes travel as the message body. A
//! response's correlation id is the broker message id of its request.

use std::fmt;
use std::str::FromStr;

use corelib::message::{MessageMetadata, NetworkRequest, NetworkResponse, ResultCode};
use corelib::{Error, NodeIdentity, Result};

use crate::broker::BrokerMessage;

/// Well-known inbox for handshake requests.
pub const QUEUE_INITIAL_INBOX: &str = "nodelink.initial";
/// Well-known inbox shared by all client-to-server requests.
pub const QUEUE_REQUEST_INBOX: &str = "nodelink.requests";

pub const PROP_MESSAGE_TYPE: &str = "messageType";
pub const PROP_PROTOCOL_VERSION: &str = "protocolVersion";
pub const PROP_METADATA: &str = "metadata";
pub const PROP_RESULT_CODE: &str = "resultCode";
pub const PROP_NEGOTIATION_TOKEN: &str = "queueNegotiation";
pub const PROP_CHANNEL_ID: &str = "channelId";
pub const PROP_MIRROR_CHANNEL_ID: &str = "mirrorChannelId";
pub const PROP_SHUTDOWN_TOKEN: &str = "shutdownToken";
pub const PROP_REQUEST_ID: &str = "requestId";
pub const PROP_REQUEST_TYPE: &str = "requestType";

/// Value of the message-type property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireMessageType {
    /// Handshake request.
    Initial,
    /// Steady-state request.
    Request,
    /// Sentinel telling a queue consumer to stop.
    ShutdownQueue,
    /// Notice that the sending side closed a channel.
    ShutdownChannel,
}

impl WireMessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            WireMessageType::Initial => "initial",
            WireMessageType::Request => "request",
            WireMessageType::ShutdownQueue => "shutdown.queue.s2c",
            WireMessageType::ShutdownChannel => "shutdown.channel",
        }
    }

    /// Message type of `message`, if it carries a known one.
    pub fn of(message: &BrokerMessage) -> Option<Self> {
        message.property(PROP_MESSAGE_TYPE).and_then(|t| t.parse().ok())
    }
}

impl fmt::Display for WireMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WireMessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initial" => Ok(WireMessageType::Initial),
            "request" => Ok(WireMessageType::Request),
            "shutdown.queue.s2c" => Ok(WireMessageType::ShutdownQueue),
            "shutdown.channel" => Ok(WireMessageType::ShutdownChannel),
            other => Err(Error::Protocol(format!("unknown message type '{}'", other))),
        }
    }
}

/// Content of a handshake request or response.
///
/// A response that carries no identity is the minimal answer to an
/// incompatible or rejected handshake.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandshakeInformation {
    pub protocol_version: String,
    pub identity: Option<NodeIdentity>,
    /// Id of the connecting side's channel; echoed back by the server.
    pub channel_id: Option<String>,
    /// Id of the server's remote-initiated counterpart (responses only).
    pub mirror_channel_id: Option<String>,
    pub negotiation_token: Option<String>,
    /// Advisory only; never verified.
    pub shutdown_token: Option<String>,
}

impl HandshakeInformation {
    /// Minimal response carrying only the protocol version.
    pub fn version_only(protocol_version: &str) -> Self {
        Self {
            protocol_version: protocol_version.to_string(),
            ..Self::default()
        }
    }

    pub fn to_message(&self, message_type: Option<WireMessageType>) -> Result<BrokerMessage> {
        let body = match &self.identity {
            Some(identity) => serde_json::to_vec(identity)?,
            None => Vec::new(),
        };
        let mut message = BrokerMessage::new(body).with_property(PROP_PROTOCOL_VERSION, self.protocol_version.as_str());
        if let Some(message_type) = message_type {
            message = message.with_property(PROP_MESSAGE_TYPE, message_type.as_str());
        }
        let optional = [
            (PROP_CHANNEL_ID, &self.channel_id),
            (PROP_MIRROR_CHANNEL_ID, &self.mirror_channel_id),
            (PROP_NEGOTIATION_TOKEN, &self.negotiation_token),
            (PROP_SHUTDOWN_TOKEN, &self.shutdown_token),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                message = message.with_property(key, value.as_str());
            }
        }
        Ok(message)
    }

    pub fn from_message(message: &BrokerMessage) -> Result<Self> {
        let protocol_version = message
            .property(PROP_PROTOCOL_VERSION)
            .ok_or_else(|| Error::Protocol("handshake message carries no protocol version".into()))?
            .to_string();
        let identity = if message.body.is_empty() {
            None
        } else {
            Some(
                serde_json::from_slice(&message.body)
                    .map_err(|e| Error::Protocol(format!("malformed node identity in handshake: {}", e)))?,
            )
        };
        let owned = |key: &str| message.property(key).map(str::to_string);
        Ok(Self {
            protocol_version,
            identity,
            channel_id: owned(PROP_CHANNEL_ID),
            mirror_channel_id: owned(PROP_MIRROR_CHANNEL_ID),
            negotiation_token: owned(PROP_NEGOTIATION_TOKEN),
            shutdown_token: owned(PROP_SHUTDOWN_TOKEN),
        })
    }
}

/// Build the broker message for a steady-state request.
pub fn encode_request(request: &NetworkRequest, channel_id: &str, reply_to: &str) -> Result<BrokerMessage> {
    Ok(BrokerMessage::new(request.content().to_vec())
        .with_property(PROP_MESSAGE_TYPE, WireMessageType::Request.as_str())
        .with_property(PROP_REQUEST_ID, request.request_id())
        .with_property(PROP_REQUEST_TYPE, request.message_type())
        .with_property(PROP_METADATA, request.metadata().to_json()?)
        .with_property(PROP_CHANNEL_ID, channel_id)
        .with_reply_to(reply_to))
}

pub fn decode_request(message: &BrokerMessage) -> Result<NetworkRequest> {
    let required = |key: &str| {
        message
            .property(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("request lacks property '{}'", key)))
    };
    let metadata = MessageMetadata::from_json(&required(PROP_METADATA)?)?;
    Ok(NetworkRequest::from_parts(
        required(PROP_REQUEST_ID)?,
        required(PROP_REQUEST_TYPE)?,
        message.body.clone(),
        metadata,
    ))
}

/// Build the broker message answering the request with broker id
/// `correlation_id`.
pub fn encode_response(response: &NetworkResponse, correlation_id: &str) -> Result<BrokerMessage> {
    Ok(BrokerMessage::new(response.content().to_vec())
        .with_correlation_id(correlation_id)
        .with_property(PROP_REQUEST_ID, response.request_id())
        .with_property(PROP_RESULT_CODE, response.result_code().code().to_string())
        .with_property(PROP_METADATA, response.metadata().to_json()?))
}

pub fn decode_response(message: &BrokerMessage) -> Result<NetworkResponse> {
    let request_id = message
        .property(PROP_REQUEST_ID)
        .ok_or_else(|| Error::Protocol("response lacks a request id".into()))?;
    let code = message
        .property(PROP_RESULT_CODE)
        .and_then(|c| c.parse::<i32>().ok())
        .ok_or_else(|| Error::Protocol("response lacks a valid result code".into()))?;
    let metadata = match message.property(PROP_METADATA) {
        Some(json) => MessageMetadata::from_json(json)?,
        None => MessageMetadata::new(),
    };
    Ok(NetworkResponse::new(
        request_id,
        ResultCode::from_code(code),
        message.body.clone(),
        metadata,
    ))
}

/// Sentinel that makes a queue consumer exit.
pub fn shutdown_queue_sentinel() -> BrokerMessage {
    BrokerMessage::new(Vec::new()).with_property(PROP_MESSAGE_TYPE, WireMessageType::ShutdownQueue.as_str())
}

/// Notice that the channel `channel_id` was closed by its owner.
pub fn shutdown_channel_message(channel_id: &str, shutdown_token: &str) -> BrokerMessage {
    BrokerMessage::new(Vec::new())
        .with_property(PROP_MESSAGE_TYPE, WireMessageType::ShutdownChannel.as_str())
        .with_property(PROP_CHANNEL_ID, channel_id)
        .with_property(PROP_SHUTDOWN_TOKEN, shutdown_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::message::factory;
    use corelib::NodeId;

    #[test]
    fn test_request_codec() {
        let request = NetworkRequest::new("rpc", vec![1, 2, 3], NodeId(5), Some(NodeId(6)));
        let message = encode_request(&request, "ch-1", "temp://a/1").unwrap();
        assert_eq!(WireMessageType::of(&message), Some(WireMessageType::Request));
        assert_eq!(message.reply_to.as_deref(), Some("temp://a/1"));
        assert_eq!(message.property(PROP_CHANNEL_ID), Some("ch-1"));
        assert_eq!(decode_request(&message).unwrap(), request);
    }

    #[test]
    fn test_response_codec() {
        let request = NetworkRequest::new("rpc", vec![], NodeId(5), None);
        let response = factory::no_route_while_forwarding(&request, NodeId(7));
        let message = encode_response(&response, "ID:x:1").unwrap();
        assert_eq!(message.correlation_id.as_deref(), Some("ID:x:1"));
        assert_eq!(WireMessageType::of(&message), None);
        assert_eq!(decode_response(&message).unwrap(), response);
    }

    #[test]
    fn test_request_without_metadata_is_rejected() {
        let message = BrokerMessage::new(vec![]).with_property(PROP_MESSAGE_TYPE, "request");
        assert!(matches!(decode_request(&message), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_handshake_version_only() {
        let info = HandshakeInformation::version_only("3.1");
        let message = info.to_message(None).unwrap();
        assert!(message.body.is_empty());
        let decoded = HandshakeInformation::from_message(&message).unwrap();
        assert_eq!(decoded.protocol_version, "3.1");
        assert!(decoded.identity.is_none());
        assert!(decoded.channel_id.is_none());
    }

    #[test]
    fn test_handshake_full() {
        let info = HandshakeInformation {
            protocol_version: "3.1".into(),
            identity: Some(NodeIdentity::with_session(NodeId(1), 9, "node-a")),
            channel_id: Some("x".into()),
            mirror_channel_id: None,
            negotiation_token: Some("a|b|".into()),
            shutdown_token: Some("s".into()),
        };
        let message = info.to_message(Some(WireMessageType::Initial)).unwrap();
        assert_eq!(WireMessageType::of(&message), Some(WireMessageType::Initial));
        assert_eq!(HandshakeInformation::from_message(&message).unwrap(), info);
    }

    #[test]
    fn test_wire_type_names() {
        for t in [
            WireMessageType::Initial,
            WireMessageType::Request,
            WireMessageType::ShutdownQueue,
            WireMessageType::ShutdownChannel,
        ] {
            assert_eq!(t.as_str().parse::<WireMessageType>().unwrap(), t);
        }
        assert_eq!(
            WireMessageType::of(&shutdown_queue_sentinel()),
            Some(WireMessageType::ShutdownQueue)
        );
    }
}

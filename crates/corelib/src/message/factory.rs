//! Construction of standard responses.
//!
//! Every failure path of the layer answers with one of these instead of
//! returning an error to the sender's thread. Failure responses carry a
//! human-readable text (or an error marker) as their content.

use crate::message::metadata::MessageMetadata;
use crate::message::request::NetworkRequest;
use crate::message::response::NetworkResponse;
use crate::message::result_code::ResultCode;
use crate::node::NodeId;

fn failure(request: &NetworkRequest, code: ResultCode, local_node: Option<NodeId>, text: String) -> NetworkResponse {
    let mut metadata = MessageMetadata::new();
    if let Some(node) = local_node {
        metadata.set_sender(node);
    }
    NetworkResponse::new(request.request_id(), code, text.into_bytes(), metadata)
}

/// Successful response with the given content.
pub fn success(request: &NetworkRequest, content: Vec<u8>) -> NetworkResponse {
    NetworkResponse::new(request.request_id(), ResultCode::Success, content, MessageMetadata::new())
}

pub fn timeout_waiting_for_response(request: &NetworkRequest, local_node: NodeId) -> NetworkResponse {
    failure(
        request,
        ResultCode::Timeout,
        Some(local_node),
        format!("Timeout waiting for a response to request {}", request.request_id()),
    )
}

pub fn channel_closed_while_waiting(request: &NetworkRequest, local_node: NodeId) -> NetworkResponse {
    failure(
        request,
        ResultCode::ChannelClosed,
        Some(local_node),
        "Channel was closed while waiting for the response".to_string(),
    )
}

pub fn channel_closed_or_broken_before_sending(request: &NetworkRequest) -> NetworkResponse {
    failure(
        request,
        ResultCode::ChannelClosedOrBrokenBeforeSending,
        None,
        "Channel was closed or broken before the request could be sent".to_string(),
    )
}

pub fn error_during_delivery(request: &NetworkRequest, local_node: NodeId, error_marker: &str) -> NetworkResponse {
    failure(request, ResultCode::ExceptionDuringDelivery, Some(local_node), error_marker.to_string())
}

pub fn error_at_destination(request: &NetworkRequest, local_node: NodeId, error_marker: &str) -> NetworkResponse {
    failure(request, ResultCode::ExceptionAtDestination, Some(local_node), error_marker.to_string())
}

/// Used both for real routing failures and for requests a non-relay node
/// refuses to forward, so the two cases cannot be told apart remotely.
pub fn no_route_while_forwarding(request: &NetworkRequest, local_node: NodeId) -> NetworkResponse {
    failure(
        request,
        ResultCode::NoRouteToDestinationWhileForwarding,
        Some(local_node),
        "No route to destination".to_string(),
    )
}

pub fn exception_while_forwarding(request: &NetworkRequest, local_node: NodeId, error_marker: &str) -> NetworkResponse {
    failure(request, ResultCode::ExceptionWhileForwarding, Some(local_node), error_marker.to_string())
}

pub fn no_handler_for_message_type(request: &NetworkRequest, local_node: NodeId) -> NetworkResponse {
    failure(
        request,
        ResultCode::NoHandlerForMessageType,
        Some(local_node),
        format!("No handler for message type '{}'", request.message_type()),
    )
}

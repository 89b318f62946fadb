//! Interfaces to the rest of the node.
//!
//! The registry delivers requests addressed to the local node to a
//! [`MessageEndpointHandler`] and hands requests for other nodes to a
//! [`MessageRoutingService`] (relay nodes only).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use corelib::logging::error_marker;
use corelib::message::{factory, NetworkRequest, NetworkResponse, MESSAGE_TYPE_HEALTH_CHECK};
use corelib::{NodeId, Result};

/// Final destination of requests addressed to the local node.
pub trait MessageEndpointHandler: Send + Sync {
    fn on_request_arrived(&self, request: &NetworkRequest) -> NetworkResponse;
}

/// Forwards requests towards their final recipient.
pub trait MessageRoutingService: Send + Sync {
    /// Forward `request` and wait for the final response. `Error::Routing`
    /// means no route is known.
    fn forward_and_await(&self, request: &NetworkRequest) -> Result<NetworkResponse>;
}

/// Handler for one message type.
pub trait RequestHandler: Send + Sync {
    fn handle_request(&self, request: &NetworkRequest) -> Result<Vec<u8>>;
}

impl<F> RequestHandler for F
where
    F: Fn(&NetworkRequest) -> Result<Vec<u8>> + Send + Sync,
{
    fn handle_request(&self, request: &NetworkRequest) -> Result<Vec<u8>> {
        self(request)
    }
}

/// [`MessageEndpointHandler`] dispatching on the request's message type.
///
/// The health check type is always served: its payload is echoed back.
pub struct RequestEndpointHandler {
    local_node: NodeId,
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
}

impl RequestEndpointHandler {
    pub fn new(local_node: NodeId) -> Self {
        Self {
            local_node,
            handlers: DashMap::new(),
        }
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register_handler(&self, message_type: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let message_type = message_type.into();
        if self.handlers.insert(message_type.clone(), handler).is_some() {
            debug!(message_type = %message_type, "Replaced request handler");
        }
    }

    pub fn unregister_handler(&self, message_type: &str) -> bool {
        self.handlers.remove(message_type).is_some()
    }
}

impl MessageEndpointHandler for RequestEndpointHandler {
    fn on_request_arrived(&self, request: &NetworkRequest) -> NetworkResponse {
        if request.message_type() == MESSAGE_TYPE_HEALTH_CHECK {
            return factory::success(request, request.content().to_vec());
        }
        let handler = self.handlers.get(request.message_type()).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            debug!(message_type = %request.message_type(), "No handler for message type");
            return factory::no_handler_for_message_type(request, self.local_node);
        };
        match handler.handle_request(request) {
            Ok(content) => factory::success(request, content),
            Err(e) => {
                let marker = error_marker();
                warn!(
                    message_type = %request.message_type(),
                    request_id = %request.request_id(),
                    error = %e,
                    marker = %marker,
                    "Request handler failed"
                );
                factory::error_at_destination(request, self.local_node, &marker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corelib::message::ResultCode;
    use corelib::Error;

    fn endpoint() -> RequestEndpointHandler {
        let endpoint = RequestEndpointHandler::new(NodeId(1));
        endpoint.register_handler(
            "upper",
            Arc::new(|request: &NetworkRequest| -> Result<Vec<u8>> {
                Ok(request.content().to_ascii_uppercase())
            }),
        );
        endpoint.register_handler(
            "fail",
            Arc::new(|_: &NetworkRequest| -> Result<Vec<u8>> { Err(Error::Consistency("boom".into())) }),
        );
        endpoint
    }

    #[test]
    fn test_dispatch_by_message_type() {
        let endpoint = endpoint();
        let request = NetworkRequest::new("upper", b"abc".to_vec(), NodeId(2), None);
        assert_eq!(endpoint.on_request_arrived(&request).content(), b"ABC");
    }

    #[test]
    fn test_health_check_echo_is_built_in() {
        let endpoint = RequestEndpointHandler::new(NodeId(1));
        let request = NetworkRequest::new(MESSAGE_TYPE_HEALTH_CHECK, vec![1, 2], NodeId(2), None);
        let response = endpoint.on_request_arrived(&request);
        assert!(response.is_success());
        assert_eq!(response.content(), &[1, 2]);
    }

    #[test]
    fn test_failures_become_responses() {
        let endpoint = endpoint();
        let unknown = NetworkRequest::new("nope", vec![], NodeId(2), None);
        assert_eq!(
            endpoint.on_request_arrived(&unknown).result_code(),
            ResultCode::NoHandlerForMessageType
        );

        let failing = NetworkRequest::new("fail", vec![], NodeId(2), None);
        let response = endpoint.on_request_arrived(&failing);
        assert_eq!(response.result_code(), ResultCode::ExceptionAtDestination);
        assert!(response.error_text().unwrap().starts_with("E#"));

        assert!(endpoint.unregister_handler("upper"));
        let request = NetworkRequest::new("upper", vec![], NodeId(2), None);
        assert!(!endpoint.on_request_arrived(&request).is_success());
    }
}

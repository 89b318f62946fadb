//! Inbound request dispatch.
//!
//! Requests read by a queue consumer are handed to the worker pool at once,
//! so a slow handler never blocks the receive loop. The response is sent to
//! the request's reply queue with the request's broker message id as
//! correlation id.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use corelib::logging::error_marker;
use corelib::message::{factory, NetworkRequest, NetworkResponse};
use corelib::{CommContext, Error, NodeId, Result};

use crate::broker::{BrokerConnection, BrokerMessage};
use crate::consumer::MessageHandler;
use crate::endpoint::ChannelEndpointHandler;
use crate::protocol::{self, WireMessageType, PROP_CHANNEL_ID};

struct DispatcherInner {
    context: CommContext,
    connection: Arc<dyn BrokerConnection>,
    local_node: NodeId,
    endpoint: Arc<dyn ChannelEndpointHandler>,
}

impl DispatcherInner {
    fn dispatch(&self, request: NetworkRequest, source_channel_id: Option<String>, reply_to: String, correlation_id: String) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            self.endpoint.on_raw_request_received(&request, source_channel_id.as_deref())
        }));
        let response = outcome.unwrap_or_else(|_| {
            let marker = error_marker();
            error!(
                request_id = %request.request_id(),
                message_type = %request.message_type(),
                marker = %marker,
                "Request handler panicked"
            );
            factory::error_at_destination(&request, self.local_node, &marker)
        });
        if let Err(e) = self.send_response(&reply_to, &correlation_id, &response) {
            warn!(request_id = %request.request_id(), reply_to = %reply_to, error = %e, "Failed to send response");
        }
    }

    fn send_response(&self, reply_to: &str, correlation_id: &str, response: &NetworkResponse) -> Result<()> {
        let message = protocol::encode_response(response, correlation_id)?;
        let session = self.connection.create_session()?;
        let result = session.send(reply_to, message);
        session.close();
        result.map(|_| ())
    }
}

/// [`MessageHandler`] for request inboxes.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<DispatcherInner>,
}

impl RequestDispatcher {
    pub fn new(
        context: CommContext,
        connection: Arc<dyn BrokerConnection>,
        local_node: NodeId,
        endpoint: Arc<dyn ChannelEndpointHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                context,
                connection,
                local_node,
                endpoint,
            }),
        }
    }
}

impl MessageHandler for RequestDispatcher {
    fn handle_message(&self, message: BrokerMessage) -> Result<()> {
        match WireMessageType::of(&message) {
            Some(WireMessageType::Request) => {
                let reply_to = message
                    .reply_to
                    .clone()
                    .ok_or_else(|| Error::Protocol("request without reply queue".into()))?;
                let correlation_id = message
                    .message_id
                    .clone()
                    .ok_or_else(|| Error::Protocol("request without message id".into()))?;
                let request = protocol::decode_request(&message)?;
                let source = message.property(PROP_CHANNEL_ID).map(str::to_string);
                let inner = Arc::clone(&self.inner);
                let rejected = request.clone();
                let (reply, correlation) = (reply_to.clone(), correlation_id.clone());
                if !self.inner.context.pool().execute("request dispatch", move || {
                    inner.dispatch(request, source, reply_to, correlation_id)
                }) {
                    let marker = error_marker();
                    warn!(
                        request_id = %rejected.request_id(),
                        marker = %marker,
                        "Worker pool rejected request; answering with a delivery error"
                    );
                    let response = factory::error_during_delivery(&rejected, self.inner.local_node, &marker);
                    self.inner.send_response(&reply, &correlation, &response)?;
                }
                Ok(())
            }
            Some(WireMessageType::ShutdownChannel) => {
                let channel_id = message
                    .property(PROP_CHANNEL_ID)
                    .ok_or_else(|| Error::Protocol("channel shutdown notice without channel id".into()))?
                    .to_string();
                debug!(channel_id = %channel_id, "Remote side closed channel");
                let endpoint = Arc::clone(&self.inner.endpoint);
                let closing = channel_id.clone();
                if !self.inner.context.pool().execute("inbound channel closing", move || {
                    endpoint.on_inbound_channel_closing(&closing)
                }) {
                    warn!(channel_id = %channel_id, "Worker pool rejected channel shutdown notice");
                }
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "unexpected message type {:?} on request inbox",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use corelib::message::ResultCode;
    use corelib::{CommConfig, NodeIdentity};

    use crate::broker::MemoryBroker;
    use crate::channel::MessageChannel;

    struct Echo;

    impl ChannelEndpointHandler for Echo {
        fn exchange_node_information(&self, _remote: &NodeIdentity) {}

        fn on_remote_initiated_channel_established(&self, _channel: Arc<MessageChannel>) {}

        fn on_inbound_channel_closing(&self, _channel_id: &str) {}

        fn on_raw_request_received(&self, request: &NetworkRequest, _source: Option<&str>) -> NetworkResponse {
            if request.message_type() == "panic" {
                panic!("handler failure");
            }
            factory::success(request, request.content().to_vec())
        }
    }

    fn setup() -> (CommContext, Arc<dyn BrokerConnection>, RequestDispatcher) {
        let broker = MemoryBroker::new("mem://dispatch");
        let connection = broker.open_connection().unwrap();
        let context = CommContext::new(CommConfig::default()).unwrap();
        let dispatcher = RequestDispatcher::new(context.clone(), Arc::clone(&connection), NodeId(7), Arc::new(Echo));
        (context, connection, dispatcher)
    }

    fn inbound(request: &NetworkRequest, message_id: &str) -> BrokerMessage {
        let mut message = protocol::encode_request(request, "ch", "replies").unwrap();
        message.message_id = Some(message_id.to_string());
        message
    }

    fn reply(connection: &Arc<dyn BrokerConnection>) -> (String, NetworkResponse) {
        let session = connection.create_session().unwrap();
        let message = session.receive_timeout("replies", Duration::from_secs(2)).unwrap().unwrap();
        let response = protocol::decode_response(&message).unwrap();
        (message.correlation_id.unwrap(), response)
    }

    #[test]
    fn test_response_is_correlated_by_message_id() {
        let (_context, connection, dispatcher) = setup();
        let request = NetworkRequest::new("echo", vec![4], NodeId(1), None);
        dispatcher.handle_message(inbound(&request, "m-1")).unwrap();

        let (correlation_id, response) = reply(&connection);
        assert_eq!(correlation_id, "m-1");
        assert_eq!(response.content(), &[4]);
    }

    #[test]
    fn test_handler_panic_becomes_error_response() {
        let (_context, connection, dispatcher) = setup();
        let request = NetworkRequest::new("panic", vec![], NodeId(1), None);
        dispatcher.handle_message(inbound(&request, "m-2")).unwrap();

        let (_, response) = reply(&connection);
        assert_eq!(response.result_code(), ResultCode::ExceptionAtDestination);
        assert!(response.error_text().unwrap().starts_with("E#"));
    }

    #[test]
    fn test_rejected_dispatch_is_answered() {
        let (context, connection, dispatcher) = setup();
        context.shutdown();
        let request = NetworkRequest::new("echo", vec![], NodeId(1), None);
        dispatcher.handle_message(inbound(&request, "m-3")).unwrap();

        let (correlation_id, response) = reply(&connection);
        assert_eq!(correlation_id, "m-3");
        assert_eq!(response.result_code(), ResultCode::ExceptionDuringDelivery);
        assert_eq!(response.request_id(), request.request_id());
    }
}

//! Listener interfaces of the channel registry.
//!
//! All callbacks are delivered asynchronously and in order per listener;
//! they never block the operation that triggered them. A listener that
//! panics receives no further callbacks.

use std::sync::Arc;

use corelib::message::{NetworkRequest, NetworkResponse};
use transport::MessageChannel;

/// Observes channels entering and leaving the registry.
pub trait MessageChannelLifecycleListener: Send + Sync {
    /// First callback after registration: the channels registered at that
    /// moment.
    fn set_initial_channels(&self, _channels: &[Arc<MessageChannel>]) {}

    fn on_channel_established(&self, _channel: &Arc<MessageChannel>) {}

    fn on_channel_terminated(&self, _channel: &Arc<MessageChannel>) {}
}

/// Observes requests and responses passing through the registry.
pub trait MessageChannelTrafficListener: Send + Sync {
    fn on_request_sent(&self, _request: &NetworkRequest, _channel_id: &str) {}

    fn on_raw_request_received(&self, _request: &NetworkRequest, _source_channel_id: Option<&str>) {}

    fn on_raw_response_generated(&self, _response: &NetworkResponse, _request: &NetworkRequest) {}
}

//! Callbacks from the transport into the owning node.

use std::sync::Arc;

use corelib::message::{NetworkRequest, NetworkResponse};
use corelib::NodeIdentity;

use crate::channel::MessageChannel;

/// Receives everything the transport cannot decide on its own.
pub trait ChannelEndpointHandler: Send + Sync {
    /// Whether inbound handshakes may be accepted. Checked before the
    /// handshake is answered; a refusal gets the minimal version-only reply.
    fn accepts_connections(&self) -> bool {
        true
    }

    /// Merge knowledge about a node learned during a handshake.
    fn exchange_node_information(&self, remote: &NodeIdentity);

    /// A remote node connected to us and the reverse channel is ready.
    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>);

    /// The remote side closed its channel `channel_id`; channels mirroring
    /// it should be closed too.
    fn on_inbound_channel_closing(&self, channel_id: &str);

    /// Produce the response for an inbound request.
    fn on_raw_request_received(&self, request: &NetworkRequest, source_channel_id: Option<&str>) -> NetworkResponse;
}

/// Notified once when a channel transitions to broken.
pub trait BrokenChannelListener: Send + Sync {
    fn on_channel_broken(&self, channel_id: &str);
}

//! Single-hop routing over the registry's own channels.

use std::sync::Weak;

use tracing::debug;

use corelib::message::{NetworkRequest, NetworkResponse};
use corelib::{Error, Result};

use crate::collaborators::MessageRoutingService;
use crate::service::MessageChannelService;

/// Forwards a request over an established outgoing channel whose remote node
/// is the final recipient. Knows no multi-hop routes.
pub struct DirectNeighborRouting {
    service: Weak<MessageChannelService>,
}

impl DirectNeighborRouting {
    pub fn new(service: Weak<MessageChannelService>) -> Self {
        Self { service }
    }
}

impl MessageRoutingService for DirectNeighborRouting {
    fn forward_and_await(&self, request: &NetworkRequest) -> Result<NetworkResponse> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| Error::Routing("channel registry is gone".into()))?;
        let recipient = request
            .metadata()
            .final_recipient()
            .ok_or_else(|| Error::Routing("request has no final recipient".into()))?;
        let channel = service
            .find_outgoing_channel_to(recipient)
            .ok_or_else(|| Error::Routing(format!("no channel to {}", recipient)))?;
        debug!(
            request_id = %request.request_id(),
            recipient = %recipient,
            channel_id = %channel.id(),
            "Forwarding request"
        );
        let timeout = service.context().config().request_timeout();
        Ok(channel.send_request_sync(request.for_forwarding(), timeout))
    }
}

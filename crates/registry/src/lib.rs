//! Node-level channel registry.
//!
//! [`MessageChannelService`] owns every channel of a node, whichever side
//! opened it. It applies the forwarding policy to inbound requests, probes
//! channels periodically and tells listeners about registrations and
//! terminations.

pub mod collaborators;
pub mod health;
pub mod listener;
pub mod node_info;
pub mod routing;
pub mod service;

pub use collaborators::{MessageEndpointHandler, MessageRoutingService, RequestEndpointHandler, RequestHandler};
pub use health::{ChannelHealthSnapshot, HealthCheckOutcome};
pub use listener::{MessageChannelLifecycleListener, MessageChannelTrafficListener};
pub use node_info::NodeInformationRegistry;
pub use routing::DirectNeighborRouting;
pub use service::MessageChannelService;

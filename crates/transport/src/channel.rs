//! Logical duplex channels.
//!
//! A [`MessageChannel`] is one direction of a node-to-node link: requests
//! go out on its outgoing request queue, responses come back on its own
//! response queue. The connecting side holds a *self-initiated* channel, the
//! accepting side a *remote-initiated* one; each names the other as its
//! mirror.
//!
//! State only moves forward: `Connecting → Established → Closed | Broken`.
//! Whichever of `close` and `mark_broken` gets there first tears the
//! channel down; the other returns `false`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use corelib::logging::error_marker;
use corelib::message::{factory, NetworkRequest, NetworkResponse};
use corelib::{CommContext, Error, NodeIdentity, Result};

use crate::broker::{BrokerConnection, BrokerMessage, BrokerSession};
use crate::connection_pool::PooledConnection;
use crate::consumer::{MessageHandler, QueueConsumer};
use crate::correlator::{await_response, ResponseCallback, ResponseCorrelator};
use crate::endpoint::BrokenChannelListener;
use crate::protocol;

/// How long teardown waits for consumers before deleting their queues.
const CONSUMER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Established,
    Closed,
    Broken,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Broken)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Established => "ESTABLISHED",
            ChannelState::Closed => "CLOSED",
            ChannelState::Broken => "BROKEN",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelDirection {
    SelfInitiated,
    RemoteInitiated,
}

/// Queue roles of one channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelQueues {
    /// Where this channel sends requests.
    pub outgoing_request_queue: String,
    /// Where responses to this channel's requests arrive.
    pub response_queue: String,
    /// Where the remote side's reverse requests arrive (self-initiated only).
    pub incoming_request_queue: Option<String>,
}

/// Direction-specific resources.
pub(crate) enum ChannelEndpoint {
    SelfInitiated {
        pooled: PooledConnection,
        request_handler: Arc<dyn MessageHandler>,
    },
    RemoteInitiated {
        connection: Arc<dyn BrokerConnection>,
    },
}

enum HeldResources {
    SelfInitiated {
        pooled: PooledConnection,
        request_consumer: QueueConsumer,
    },
    RemoteInitiated,
}

pub(crate) struct ChannelSetup {
    pub id: String,
    pub local_node: NodeIdentity,
    pub remote_node: NodeIdentity,
    pub mirror_channel_id: Option<String>,
    pub shutdown_token: String,
    pub queues: ChannelQueues,
    pub send_session: Arc<dyn BrokerSession>,
    pub endpoint: ChannelEndpoint,
}

struct ResponseHandler {
    correlator: ResponseCorrelator,
}

impl MessageHandler for ResponseHandler {
    fn handle_message(&self, message: BrokerMessage) -> Result<()> {
        let correlation_id = message
            .correlation_id
            .clone()
            .ok_or_else(|| Error::Protocol("response without correlation id".into()))?;
        let response = protocol::decode_response(&message)?;
        self.correlator.on_response(correlation_id, response);
        Ok(())
    }
}

pub struct MessageChannel {
    id: String,
    direction: ChannelDirection,
    local_node: NodeIdentity,
    remote_node: NodeIdentity,
    mirror_channel_id: Mutex<Option<String>>,
    shutdown_token: String,
    state: Mutex<ChannelState>,
    queues: ChannelQueues,
    connection: Arc<dyn BrokerConnection>,
    send_session: Arc<dyn BrokerSession>,
    correlator: ResponseCorrelator,
    response_consumer: QueueConsumer,
    resources: Mutex<Option<HeldResources>>,
    broken_listener: Mutex<Option<Arc<dyn BrokenChannelListener>>>,
    context: CommContext,
}

impl MessageChannel {
    /// Start the channel's consumers. The channel begins in `Connecting`.
    pub(crate) fn open(context: &CommContext, setup: ChannelSetup) -> Result<Arc<Self>> {
        let correlator = ResponseCorrelator::new(context.clone(), setup.local_node.node_id, setup.id.clone());
        let short_id = short(&setup.id);
        let (direction, connection) = match &setup.endpoint {
            ChannelEndpoint::SelfInitiated { pooled, .. } => {
                (ChannelDirection::SelfInitiated, Arc::clone(pooled.connection()))
            }
            ChannelEndpoint::RemoteInitiated { connection } => (ChannelDirection::RemoteInitiated, Arc::clone(connection)),
        };
        let response_consumer = QueueConsumer::start(
            format!("responses-{}", short_id),
            Arc::clone(&connection),
            setup.queues.response_queue.clone(),
            Arc::new(ResponseHandler {
                correlator: correlator.clone(),
            }),
            context.pool().clone(),
        )?;
        let resources = match setup.endpoint {
            ChannelEndpoint::SelfInitiated { pooled, request_handler } => {
                let Some(request_queue) = setup.queues.incoming_request_queue.clone() else {
                    response_consumer.trigger_shutdown();
                    return Err(Error::Consistency("self-initiated channel without request queue".into()));
                };
                let request_consumer = QueueConsumer::start(
                    format!("requests-{}", short_id),
                    Arc::clone(&connection),
                    request_queue,
                    request_handler,
                    context.pool().clone(),
                )
                .map_err(|e| {
                    response_consumer.trigger_shutdown();
                    e
                })?;
                HeldResources::SelfInitiated { pooled, request_consumer }
            }
            ChannelEndpoint::RemoteInitiated { .. } => HeldResources::RemoteInitiated,
        };
        Ok(Arc::new(Self {
            id: setup.id,
            direction,
            local_node: setup.local_node,
            remote_node: setup.remote_node,
            mirror_channel_id: Mutex::new(setup.mirror_channel_id),
            shutdown_token: setup.shutdown_token,
            state: Mutex::new(ChannelState::Connecting),
            queues: setup.queues,
            connection,
            send_session: setup.send_session,
            correlator,
            response_consumer,
            resources: Mutex::new(Some(resources)),
            broken_listener: Mutex::new(None),
            context: context.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> ChannelDirection {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_established(&self) -> bool {
        self.state() == ChannelState::Established
    }

    pub fn local_node(&self) -> &NodeIdentity {
        &self.local_node
    }

    pub fn remote_node(&self) -> &NodeIdentity {
        &self.remote_node
    }

    pub fn mirror_channel_id(&self) -> Option<String> {
        self.mirror_channel_id.lock().clone()
    }

    pub fn set_mirror_channel_id(&self, mirror: impl Into<String>) {
        *self.mirror_channel_id.lock() = Some(mirror.into());
    }

    /// Advisory token presented when this channel's owner shuts it down.
    pub fn shutdown_token(&self) -> &str {
        &self.shutdown_token
    }

    pub fn queues(&self) -> &ChannelQueues {
        &self.queues
    }

    pub fn pending_request_count(&self) -> usize {
        self.correlator.pending_count()
    }

    pub fn set_broken_listener(&self, listener: Arc<dyn BrokenChannelListener>) {
        *self.broken_listener.lock() = Some(listener);
    }

    /// `Connecting → Established`. Returns `false` from any other state.
    pub fn mark_established(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ChannelState::Connecting {
            return false;
        }
        *state = ChannelState::Established;
        true
    }

    /// Send `request`; `callback` receives exactly one response, which may
    /// be a failure response (timeout, channel closed, delivery error).
    pub fn send_request(&self, request: NetworkRequest, callback: ResponseCallback, timeout: Duration) {
        if !self.is_established() {
            self.deliver(callback, factory::channel_closed_or_broken_before_sending(&request));
            return;
        }
        let message = match protocol::encode_request(&request, &self.id, &self.queues.response_queue) {
            Ok(message) => message,
            Err(e) => {
                let marker = error_marker();
                warn!(channel_id = %self.id, error = %e, marker = %marker, "Failed to encode request");
                self.deliver(callback, factory::error_during_delivery(&request, self.local_node.node_id, &marker));
                return;
            }
        };
        match self.send_session.send(&self.queues.outgoing_request_queue, message) {
            Ok(message_id) => self.correlator.register(message_id, request, callback, timeout),
            Err(e) => {
                let marker = error_marker();
                warn!(
                    channel_id = %self.id,
                    error = %e,
                    marker = %marker,
                    "Failed to send request; marking channel as broken"
                );
                self.deliver(callback, factory::error_during_delivery(&request, self.local_node.node_id, &marker));
                self.mark_broken();
            }
        }
    }

    /// Blocking variant of [`MessageChannel::send_request`].
    pub fn send_request_sync(&self, request: NetworkRequest, timeout: Duration) -> NetworkResponse {
        await_response(request, self.local_node.node_id, timeout, |request, callback| {
            self.send_request(request, callback, timeout)
        })
    }

    /// Close the channel. Self-initiated channels notify the remote side.
    /// Returns `false` if the channel was already closed or broken.
    pub fn close(&self) -> bool {
        if !self.transition_to(ChannelState::Closed) {
            return false;
        }
        info!(channel_id = %self.id, remote = %self.remote_node, "Closing channel");
        self.teardown(true);
        true
    }

    /// Mark the channel as broken and notify the broken-channel listener.
    /// Returns `false` if the channel was already closed or broken.
    pub fn mark_broken(&self) -> bool {
        if !self.transition_to(ChannelState::Broken) {
            return false;
        }
        warn!(channel_id = %self.id, remote = %self.remote_node, "Channel is broken");
        self.teardown(false);
        let listener = self.broken_listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_channel_broken(&self.id);
        }
        true
    }

    fn transition_to(&self, target: ChannelState) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = target;
        true
    }

    fn deliver(&self, callback: ResponseCallback, response: NetworkResponse) {
        if !self.context.pool().execute("response delivery", move || callback(response)) {
            warn!(channel_id = %self.id, "Worker pool unavailable; response callback dropped");
        }
    }

    fn teardown(&self, notify_remote: bool) {
        if notify_remote && self.direction == ChannelDirection::SelfInitiated {
            let notice = protocol::shutdown_channel_message(&self.id, &self.shutdown_token);
            if let Err(e) = self.send_session.send(&self.queues.outgoing_request_queue, notice) {
                debug!(channel_id = %self.id, error = %e, "Could not notify remote side of channel close");
            }
        }
        self.correlator.close_all_pending();
        self.response_consumer.trigger_shutdown();

        let resources = self.resources.lock().take();
        let request_consumer = match &resources {
            Some(HeldResources::SelfInitiated { request_consumer, .. }) => {
                request_consumer.trigger_shutdown();
                Some(request_consumer.clone())
            }
            _ => None,
        };

        let response_consumer = self.response_consumer.clone();
        let session = Arc::clone(&self.send_session);
        let connection = Arc::clone(&self.connection);
        let mut temp_queues = vec![self.queues.response_queue.clone()];
        temp_queues.extend(self.queues.incoming_request_queue.clone());
        let channel_id = self.id.clone();
        self.context.pool().execute("channel cleanup", move || {
            response_consumer.wait_stopped(CONSUMER_STOP_TIMEOUT);
            if let Some(consumer) = &request_consumer {
                consumer.wait_stopped(CONSUMER_STOP_TIMEOUT);
            }
            if !connection.is_closed() {
                for queue in &temp_queues {
                    if let Err(e) = session.delete_queue(queue) {
                        debug!(channel_id = %channel_id, queue = %queue, error = %e, "Could not delete queue");
                    }
                }
            }
            session.close();
            // releases the pooled connection of self-initiated channels
            drop(resources);
            debug!(channel_id = %channel_id, "Channel resources released");
        });
    }
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .field("remote_node", &self.remote_node)
            .finish()
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

//! Channel establishment.
//!
//! Active side: create the two client queues, send a handshake request to
//! the remote broker's initial inbox and wait for the correlated answer.
//! Passive side: a consumer on the initial inbox validates the request,
//! creates the server response queue and the remote-initiated channel, and
//! answers with the server half of the queue negotiation.
//!
//! A rejected handshake (incompatible version, self-connection, malformed
//! request) is answered with the server's protocol version only. Nothing is
//! registered on either side in that case, and partially created broker
//! resources are removed again.

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use tracing::{debug, info, warn};

use corelib::{CommContext, Error, NodeIdentity, Result};

use crate::broker::{BrokerConnection, BrokerMessage, BrokerSession};
use crate::channel::{ChannelEndpoint, ChannelQueues, ChannelSetup, MessageChannel};
use crate::connection_pool::PooledConnection;
use crate::consumer::MessageHandler;
use crate::endpoint::ChannelEndpointHandler;
use crate::negotiation::{ClientQueueOffer, ServerQueueAnswer};
use crate::protocol::{HandshakeInformation, WireMessageType, QUEUE_INITIAL_INBOX, QUEUE_REQUEST_INBOX};
use crate::request_dispatch::RequestDispatcher;

/// Session and temporary queues of a handshake in progress. Dropping it
/// without [`HandshakeResources::disarm`] deletes the queues and closes the
/// session.
struct HandshakeResources {
    session: Arc<dyn BrokerSession>,
    temp_queues: Vec<String>,
    armed: bool,
}

impl HandshakeResources {
    fn new(session: Arc<dyn BrokerSession>) -> Self {
        Self {
            session,
            temp_queues: Vec::new(),
            armed: true,
        }
    }

    fn create_temporary_queue(&mut self) -> Result<String> {
        let queue = self.session.create_temporary_queue()?;
        self.temp_queues.push(queue.clone());
        Ok(queue)
    }

    fn session(&self) -> Arc<dyn BrokerSession> {
        Arc::clone(&self.session)
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for HandshakeResources {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        for queue in &self.temp_queues {
            let _ = self.session.delete_queue(queue);
        }
        self.session.close();
        debug!(queues = self.temp_queues.len(), "Released resources of failed handshake");
    }
}

/// Connect over `pooled` and return the established self-initiated channel.
pub(crate) fn initiate(
    context: &CommContext,
    pooled: PooledConnection,
    local: &NodeIdentity,
    endpoint: Arc<dyn ChannelEndpointHandler>,
) -> Result<Arc<MessageChannel>> {
    let config = context.config();
    let connection = Arc::clone(pooled.connection());
    let mut resources = HandshakeResources::new(connection.create_session()?);
    let offer = ClientQueueOffer {
        response_queue: resources.create_temporary_queue()?,
        request_queue: resources.create_temporary_queue()?,
    };
    let channel_id = uuid::Uuid::new_v4().to_string();
    let shutdown_token = uuid::Uuid::new_v4().to_string();

    let request = HandshakeInformation {
        protocol_version: config.protocol_version.clone(),
        identity: Some(local.clone()),
        channel_id: Some(channel_id.clone()),
        mirror_channel_id: None,
        negotiation_token: Some(offer.encode()),
        shutdown_token: Some(shutdown_token.clone()),
    };
    let message = request
        .to_message(Some(WireMessageType::Initial))?
        .with_reply_to(offer.response_queue.clone());
    debug!(address = %pooled.address(), channel_id = %channel_id, "Sending handshake request");
    let sent_id = resources.session.send(QUEUE_INITIAL_INBOX, message)?;

    let reply = await_reply(&*resources.session, &offer.response_queue, &sent_id, config.handshake_timeout())?;
    let answer = HandshakeInformation::from_message(&reply)?;

    if answer.protocol_version != config.protocol_version {
        counter!("nodelink_handshakes_total", "outcome" => "version_mismatch").increment(1);
        return Err(Error::Protocol(format!(
            "incompatible protocol version: local {}, remote {}",
            config.protocol_version, answer.protocol_version
        )));
    }
    let Some(remote) = answer.identity else {
        counter!("nodelink_handshakes_total", "outcome" => "rejected").increment(1);
        return Err(Error::Protocol(format!(
            "handshake rejected by {}",
            pooled.address()
        )));
    };
    if &remote == local {
        return Err(Error::Protocol("remote node has the local identity; refusing self-connection".into()));
    }
    if answer.channel_id.as_deref() != Some(channel_id.as_str()) {
        return Err(Error::Protocol(format!(
            "handshake response names channel {:?}, expected {}",
            answer.channel_id, channel_id
        )));
    }
    let token = answer
        .negotiation_token
        .ok_or_else(|| Error::Protocol("handshake response carries no queue negotiation".into()))?;
    let server = ServerQueueAnswer::decode(&token)?;

    let dispatcher = RequestDispatcher::new(context.clone(), Arc::clone(&connection), local.node_id, Arc::clone(&endpoint));
    let channel = MessageChannel::open(
        context,
        ChannelSetup {
            id: channel_id,
            local_node: local.clone(),
            remote_node: remote.clone(),
            mirror_channel_id: answer.mirror_channel_id,
            shutdown_token,
            queues: ChannelQueues {
                outgoing_request_queue: server.request_queue,
                response_queue: offer.response_queue,
                incoming_request_queue: Some(offer.request_queue),
            },
            send_session: resources.session(),
            endpoint: ChannelEndpoint::SelfInitiated {
                pooled,
                request_handler: Arc::new(dispatcher),
            },
        },
    )?;
    resources.disarm();

    endpoint.exchange_node_information(&remote);
    channel.mark_established();
    counter!("nodelink_handshakes_total", "outcome" => "connected").increment(1);
    info!(channel_id = %channel.id(), remote = %remote, "Channel established");
    Ok(channel)
}

fn await_reply(
    session: &dyn BrokerSession,
    queue: &str,
    correlation_id: &str,
    timeout: std::time::Duration,
) -> Result<BrokerMessage> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let message = if remaining.is_zero() {
            None
        } else {
            session.receive_timeout(queue, remaining)?
        };
        match message {
            Some(message) if message.correlation_id.as_deref() == Some(correlation_id) => return Ok(message),
            Some(_) => debug!(queue, "Ignoring unrelated message while awaiting handshake response"),
            None => {
                return Err(Error::Timeout(format!(
                    "no handshake response within {:?}",
                    timeout
                )))
            }
        }
    }
}

struct InitialInboxInner {
    context: CommContext,
    connection: Arc<dyn BrokerConnection>,
    local: NodeIdentity,
    endpoint: Arc<dyn ChannelEndpointHandler>,
}

impl InitialInboxInner {
    fn reply(&self, reply_to: &str, correlation_id: &str, info: &HandshakeInformation) -> Result<()> {
        let message = info.to_message(None)?.with_correlation_id(correlation_id);
        let session = self.connection.create_session()?;
        let result = session.send(reply_to, message);
        session.close();
        result.map(|_| ())
    }

    fn reject(&self, reply_to: &str, correlation_id: &str) {
        counter!("nodelink_handshakes_total", "outcome" => "rejected").increment(1);
        let minimal = HandshakeInformation::version_only(&self.context.config().protocol_version);
        if let Err(e) = self.reply(reply_to, correlation_id, &minimal) {
            warn!(reply_to, error = %e, "Failed to send handshake rejection");
        }
    }

    fn accept(&self, message: BrokerMessage, reply_to: String, correlation_id: String) {
        let info = match HandshakeInformation::from_message(&message) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "Malformed handshake request");
                return self.reject(&reply_to, &correlation_id);
            }
        };
        let local_version = &self.context.config().protocol_version;
        if &info.protocol_version != local_version {
            warn!(
                remote_version = %info.protocol_version,
                local_version = %local_version,
                "Rejecting handshake with incompatible protocol version"
            );
            return self.reject(&reply_to, &correlation_id);
        }
        let (Some(remote), Some(client_channel_id), Some(token)) =
            (info.identity, info.channel_id, info.negotiation_token)
        else {
            warn!("Handshake request lacks identity, channel id or queue negotiation");
            return self.reject(&reply_to, &correlation_id);
        };
        if remote == self.local {
            warn!(identity = %remote, "Rejecting handshake from the local node itself");
            return self.reject(&reply_to, &correlation_id);
        }
        if !self.endpoint.accepts_connections() {
            info!(remote = %remote, "Not accepting connections; rejecting handshake");
            return self.reject(&reply_to, &correlation_id);
        }
        let offer = match ClientQueueOffer::decode(&token) {
            Ok(offer) => offer,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Invalid queue negotiation token");
                return self.reject(&reply_to, &correlation_id);
            }
        };
        let shutdown_token = info
            .shutdown_token
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (channel, answer) = match self.open_remote_initiated(&remote, &client_channel_id, offer, shutdown_token) {
            Ok(opened) => opened,
            Err(e) => {
                warn!(remote = %remote, error = %e, "Failed to set up remote-initiated channel");
                return self.reject(&reply_to, &correlation_id);
            }
        };
        if let Err(e) = self.reply(&reply_to, &correlation_id, &answer) {
            warn!(remote = %remote, error = %e, "Failed to send handshake response; discarding channel");
            channel.close();
            return;
        }
        counter!("nodelink_handshakes_total", "outcome" => "accepted").increment(1);
        info!(channel_id = %channel.id(), remote = %remote, mirror = %client_channel_id, "Accepted channel");
        self.endpoint.on_remote_initiated_channel_established(channel);
    }

    fn open_remote_initiated(
        &self,
        remote: &NodeIdentity,
        client_channel_id: &str,
        offer: ClientQueueOffer,
        shutdown_token: String,
    ) -> Result<(Arc<MessageChannel>, HandshakeInformation)> {
        let mut resources = HandshakeResources::new(self.connection.create_session()?);
        let response_queue = resources.create_temporary_queue()?;
        let answer_token = ServerQueueAnswer {
            request_queue: QUEUE_REQUEST_INBOX.to_string(),
            response_queue: response_queue.clone(),
        }
        .encode();
        let channel = MessageChannel::open(
            &self.context,
            ChannelSetup {
                id: uuid::Uuid::new_v4().to_string(),
                local_node: self.local.clone(),
                remote_node: remote.clone(),
                mirror_channel_id: Some(client_channel_id.to_string()),
                shutdown_token,
                queues: ChannelQueues {
                    outgoing_request_queue: offer.request_queue,
                    response_queue,
                    incoming_request_queue: None,
                },
                send_session: resources.session(),
                endpoint: ChannelEndpoint::RemoteInitiated {
                    connection: Arc::clone(&self.connection),
                },
            },
        )?;
        resources.disarm();

        self.endpoint.exchange_node_information(remote);
        channel.mark_established();
        let answer = HandshakeInformation {
            protocol_version: self.context.config().protocol_version.clone(),
            identity: Some(self.local.clone()),
            channel_id: Some(client_channel_id.to_string()),
            mirror_channel_id: Some(channel.id().to_string()),
            negotiation_token: Some(answer_token),
            shutdown_token: Some(channel.shutdown_token().to_string()),
        };
        Ok((channel, answer))
    }
}

/// Consumer handler of the initial inbox.
#[derive(Clone)]
pub(crate) struct InitialInboxHandler {
    inner: Arc<InitialInboxInner>,
}

impl InitialInboxHandler {
    pub(crate) fn new(
        context: CommContext,
        connection: Arc<dyn BrokerConnection>,
        local: NodeIdentity,
        endpoint: Arc<dyn ChannelEndpointHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(InitialInboxInner {
                context,
                connection,
                local,
                endpoint,
            }),
        }
    }
}

impl MessageHandler for InitialInboxHandler {
    fn handle_message(&self, message: BrokerMessage) -> Result<()> {
        if WireMessageType::of(&message) != Some(WireMessageType::Initial) {
            return Err(Error::Protocol("non-handshake message on initial inbox".into()));
        }
        let reply_to = message
            .reply_to
            .clone()
            .ok_or_else(|| Error::Protocol("handshake request without reply queue".into()))?;
        let correlation_id = message
            .message_id
            .clone()
            .ok_or_else(|| Error::Protocol("handshake request without message id".into()))?;
        let inner = Arc::clone(&self.inner);
        self.inner
            .context
            .pool()
            .execute("handshake", move || inner.accept(message, reply_to, correlation_id));
        Ok(())
    }
}

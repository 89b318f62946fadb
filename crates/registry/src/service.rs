//! The message channel service: the node's directory of live channels.
//!
//! # Responsibilities
//!
//! - Connect to other nodes and accept their connections
//! - Keep every established channel (both directions) in one map
//! - Broadcast registrations and terminations to lifecycle listeners
//! - Apply the forwarding policy to inbound requests
//! - Probe channels periodically and evict broken ones
//!
//! # Concurrency
//!
//! The channel map is only mutated under a short-held mutex. Listener
//! callbacks are queued while holding it, so every listener observes
//! registrations in map order, but they run later on the worker pool.
//! Network I/O never happens under the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tracing::{debug, error, info, warn};

use corelib::logging::error_marker;
use corelib::message::{factory, NetworkRequest, NetworkResponse};
use corelib::pool::ScheduledHandle;
use corelib::{AsyncOrderedCallbackManager, CallbackExceptionPolicy, CommContext, Error, NodeId, NodeIdentity, Result};
use transport::{
    await_response, BrokenChannelListener, BrokerConnector, ChannelDirection, ChannelEndpointHandler, MessageChannel,
    ResponseCallback, ServerHandle, TransportProvider,
};

use crate::collaborators::{MessageEndpointHandler, MessageRoutingService, RequestEndpointHandler};
use crate::health::{self, ChannelHealthSnapshot, ChannelHealthState, HealthCheckOutcome};
use crate::listener::{MessageChannelLifecycleListener, MessageChannelTrafficListener};
use crate::node_info::NodeInformationRegistry;

/// Registry of the channels of one node.
pub struct MessageChannelService {
    context: CommContext,
    local: NodeIdentity,
    provider: TransportProvider,
    channels: Mutex<HashMap<String, Arc<MessageChannel>>>,
    health: DashMap<String, Arc<ChannelHealthState>>,
    lifecycle_listeners: AsyncOrderedCallbackManager<dyn MessageChannelLifecycleListener>,
    traffic_listeners: AsyncOrderedCallbackManager<dyn MessageChannelTrafficListener>,
    node_information: NodeInformationRegistry,
    request_endpoint: Arc<RequestEndpointHandler>,
    message_endpoint: RwLock<Arc<dyn MessageEndpointHandler>>,
    routing: RwLock<Option<Arc<dyn MessageRoutingService>>>,
    shutdown: AtomicBool,
    server: Mutex<Option<ServerHandle>>,
    health_monitor: Mutex<Option<ScheduledHandle>>,
    transport_adapter: Arc<TransportAdapter>,
}

impl MessageChannelService {
    pub fn new(context: CommContext, local: NodeIdentity, connector: Arc<dyn BrokerConnector>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let pool = context.pool().clone();
            let request_endpoint = Arc::new(RequestEndpointHandler::new(local.node_id));
            let default_endpoint: Arc<dyn MessageEndpointHandler> = request_endpoint.clone();
            Self {
                provider: TransportProvider::new(context.clone(), connector),
                channels: Mutex::new(HashMap::new()),
                health: DashMap::new(),
                lifecycle_listeners: AsyncOrderedCallbackManager::new(
                    pool.clone(),
                    CallbackExceptionPolicy::LogAndCancelListener,
                ),
                traffic_listeners: AsyncOrderedCallbackManager::new(pool, CallbackExceptionPolicy::LogAndCancelListener),
                node_information: NodeInformationRegistry::new(),
                message_endpoint: RwLock::new(default_endpoint),
                request_endpoint,
                routing: RwLock::new(None),
                shutdown: AtomicBool::new(false),
                server: Mutex::new(None),
                health_monitor: Mutex::new(None),
                transport_adapter: Arc::new(TransportAdapter { service: weak.clone() }),
                context,
                local,
            }
        })
    }

    pub fn local_identity(&self) -> &NodeIdentity {
        &self.local
    }

    pub fn context(&self) -> &CommContext {
        &self.context
    }

    pub fn node_information(&self) -> &NodeInformationRegistry {
        &self.node_information
    }

    /// The default endpoint, dispatching by message type.
    pub fn request_endpoint(&self) -> &Arc<RequestEndpointHandler> {
        &self.request_endpoint
    }

    /// Replace the endpoint receiving requests addressed to this node.
    pub fn set_message_endpoint_handler(&self, handler: Arc<dyn MessageEndpointHandler>) {
        *self.message_endpoint.write() = handler;
    }

    pub fn set_routing_service(&self, routing: Arc<dyn MessageRoutingService>) {
        *self.routing.write() = Some(routing);
    }

    // ---- connection setup ----

    /// Accept handshakes and requests on the broker at `address`.
    pub fn start_server(&self, address: &str) -> Result<()> {
        let handle = self.provider.start_server(address, self.local.clone(), self.endpoint_handler())?;
        if let Some(previous) = self.server.lock().replace(handle) {
            previous.shutdown();
        }
        Ok(())
    }

    /// Connect to the node serving `contact_point` and register the channel.
    pub fn connect(&self, contact_point: &str) -> Result<Arc<MessageChannel>> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ChannelState("node is shutting down; not connecting".into()));
        }
        let channel = self
            .provider
            .connect(contact_point, &self.local, self.endpoint_handler())?;
        channel.set_broken_listener(self.transport_adapter.clone());
        if let Err(e) = self.register_channel(Arc::clone(&channel)) {
            channel.close();
            return Err(e);
        }
        Ok(channel)
    }

    fn endpoint_handler(&self) -> Arc<dyn ChannelEndpointHandler> {
        self.transport_adapter.clone()
    }

    // ---- registry ----

    /// Add an established channel and notify lifecycle listeners.
    pub fn register_channel(&self, channel: Arc<MessageChannel>) -> Result<()> {
        if !channel.is_established() {
            return Err(Error::ChannelState(format!(
                "channel {} is {}, not established",
                channel.id(),
                channel.state()
            )));
        }
        let id = channel.id().to_string();
        {
            let mut channels = self.channels.lock();
            if channels.contains_key(&id) {
                let marker = error_marker();
                error!(channel_id = %id, marker = %marker, "Channel registered twice");
                return Err(Error::Consistency(format!("duplicate registration of channel {} ({})", id, marker)));
            }
            channels.insert(id.clone(), Arc::clone(&channel));
            self.health.insert(
                id.clone(),
                Arc::new(ChannelHealthState::new(self.context.config().health_check_failure_limit)),
            );
            let established = Arc::clone(&channel);
            self.lifecycle_listeners
                .enqueue_callback(move |listener| listener.on_channel_established(&established));
        }
        counter!("nodelink_channels_registered_total").increment(1);
        info!(
            channel_id = %id,
            remote = %channel.remote_node(),
            direction = ?channel.direction(),
            "Registered channel"
        );
        Ok(())
    }

    /// Remove a channel. Only the first call for an id has any effect.
    pub fn deregister_channel(&self, channel_id: &str) -> Option<Arc<MessageChannel>> {
        let removed = {
            let mut channels = self.channels.lock();
            let removed = channels.remove(channel_id)?;
            self.health.remove(channel_id);
            let terminated = Arc::clone(&removed);
            self.lifecycle_listeners
                .enqueue_callback(move |listener| listener.on_channel_terminated(&terminated));
            removed
        };
        counter!("nodelink_channels_terminated_total").increment(1);
        info!(channel_id, state = %removed.state(), "Deregistered channel");
        Some(removed)
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<Arc<MessageChannel>> {
        self.channels.lock().get(channel_id).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<MessageChannel>> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// An established self-initiated channel to `node`, if any.
    pub fn find_outgoing_channel_to(&self, node: NodeId) -> Option<Arc<MessageChannel>> {
        self.channels
            .lock()
            .values()
            .find(|c| {
                c.direction() == ChannelDirection::SelfInitiated && c.remote_node().node_id == node && c.is_established()
            })
            .cloned()
    }

    /// Close a channel and deregister it. Returns `false` if the id is
    /// unknown.
    pub fn close_channel(&self, channel_id: &str) -> bool {
        let Some(channel) = self.get_channel(channel_id) else {
            return false;
        };
        channel.close();
        self.deregister_channel(channel_id);
        true
    }

    /// Close every registered channel whose mirror is `mirror_channel_id`.
    pub fn close_mirror_channels(&self, mirror_channel_id: &str) -> usize {
        let mirrors: Vec<String> = self
            .channels
            .lock()
            .values()
            .filter(|c| c.mirror_channel_id().as_deref() == Some(mirror_channel_id))
            .map(|c| c.id().to_string())
            .collect();
        for id in &mirrors {
            debug!(channel_id = %id, mirror = mirror_channel_id, "Closing mirror channel");
            self.close_channel(id);
        }
        mirrors.len()
    }

    /// Reject new connects (and accepted handshakes) from now on.
    pub fn set_shutdown_flag(&self, shutdown: bool) {
        self.shutdown.store(shutdown, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Close all registered channels.
    pub fn close_all_channels(&self) {
        let ids: Vec<String> = self.channels.lock().keys().cloned().collect();
        for id in &ids {
            self.close_channel(id);
        }
        let remaining = self.channel_count();
        if remaining > 0 {
            warn!(remaining, "Channels still registered after closing all channels");
        }
    }

    /// Stop the node: no new channels, no health checks, all channels
    /// closed, server stopped.
    pub fn shutdown(&self) {
        self.set_shutdown_flag(true);
        self.stop_health_monitor();
        self.close_all_channels();
        if let Some(server) = self.server.lock().take() {
            server.shutdown();
        }
    }

    // ---- listeners ----

    /// Add a lifecycle listener. Its first callback is
    /// `set_initial_channels` with the channels registered at this moment.
    pub fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>) {
        let channels = self.channels.lock();
        let snapshot: Vec<Arc<MessageChannel>> = channels.values().cloned().collect();
        self.lifecycle_listeners
            .add_listener_and_enqueue_callback(listener, move |l| l.set_initial_channels(&snapshot));
    }

    pub fn remove_lifecycle_listener(&self, listener: &Arc<dyn MessageChannelLifecycleListener>) -> bool {
        self.lifecycle_listeners.remove_listener(listener)
    }

    pub fn add_traffic_listener(&self, listener: Arc<dyn MessageChannelTrafficListener>) {
        self.traffic_listeners.add_listener(listener);
    }

    pub fn remove_traffic_listener(&self, listener: &Arc<dyn MessageChannelTrafficListener>) -> bool {
        self.traffic_listeners.remove_listener(listener)
    }

    // ---- requests ----

    /// Send `request` over the channel `channel_id`. An unknown channel is
    /// answered with a "closed or broken before sending" response.
    pub fn send_request_by_channel_id(
        &self,
        channel_id: &str,
        request: NetworkRequest,
        callback: ResponseCallback,
        timeout: Duration,
    ) {
        let Some(channel) = self.get_channel(channel_id) else {
            debug!(channel_id, "Request for unknown channel");
            let response = factory::channel_closed_or_broken_before_sending(&request);
            self.context.pool().execute("response delivery", move || callback(response));
            return;
        };
        let message_type = request.message_type().to_string();
        counter!("nodelink_request_bytes_sent_total", "message_type" => message_type.clone())
            .increment(request.content().len() as u64);
        counter!("nodelink_requests_sent_total", "message_type" => message_type).increment(1);
        if self.traffic_listeners.listener_count() > 0 {
            let sent = request.clone();
            let id = channel_id.to_string();
            self.traffic_listeners
                .enqueue_callback(move |listener| listener.on_request_sent(&sent, &id));
        }
        channel.send_request(request, callback, timeout);
    }

    /// Blocking variant of [`Self::send_request_by_channel_id`].
    pub fn send_request_sync_by_channel_id(&self, channel_id: &str, request: NetworkRequest, timeout: Duration) -> NetworkResponse {
        await_response(request, self.local.node_id, timeout, |request, callback| {
            self.send_request_by_channel_id(channel_id, request, callback, timeout)
        })
    }

    /// Produce the response to an inbound request, forwarding it if it is
    /// addressed to another node and this node is a relay.
    pub fn handle_incoming_request(&self, request: &NetworkRequest, source_channel_id: Option<&str>) -> NetworkResponse {
        let message_type = request.message_type().to_string();
        counter!("nodelink_request_bytes_received_total", "message_type" => message_type.clone())
            .increment(request.content().len() as u64);
        counter!("nodelink_requests_received_total", "message_type" => message_type).increment(1);
        if self.traffic_listeners.listener_count() > 0 {
            let received = request.clone();
            let source = source_channel_id.map(str::to_string);
            self.traffic_listeners
                .enqueue_callback(move |listener| listener.on_raw_request_received(&received, source.as_deref()));
        }

        let mut response = match request.metadata().final_recipient() {
            Some(recipient) if recipient != self.local.node_id => self.forward(request, recipient),
            _ => {
                let endpoint = self.message_endpoint.read().clone();
                endpoint.on_request_arrived(request)
            }
        };
        if !response.metadata().has_sender() {
            response.metadata_mut().set_sender(self.local.node_id);
        }

        if self.traffic_listeners.listener_count() > 0 {
            let generated = response.clone();
            let origin = request.clone();
            self.traffic_listeners
                .enqueue_callback(move |listener| listener.on_raw_response_generated(&generated, &origin));
        }
        response
    }

    fn forward(&self, request: &NetworkRequest, recipient: NodeId) -> NetworkResponse {
        if !self.context.config().is_relay {
            debug!(
                request_id = %request.request_id(),
                recipient = %recipient,
                "Not a relay; refusing to forward"
            );
            return factory::no_route_while_forwarding(request, self.local.node_id);
        }
        let routing = self.routing.read().clone();
        let Some(routing) = routing else {
            return factory::no_route_while_forwarding(request, self.local.node_id);
        };
        counter!("nodelink_requests_forwarded_total").increment(1);
        match routing.forward_and_await(request) {
            Ok(response) => response,
            Err(Error::Routing(reason)) => {
                debug!(request_id = %request.request_id(), reason = %reason, "No route while forwarding");
                factory::no_route_while_forwarding(request, self.local.node_id)
            }
            Err(e) => {
                let marker = error_marker();
                warn!(request_id = %request.request_id(), error = %e, marker = %marker, "Forwarding failed");
                factory::exception_while_forwarding(request, self.local.node_id, &marker)
            }
        }
    }

    // ---- health ----

    /// Probe every registered channel after a random delay and repeat at
    /// the configured interval. A second call replaces the first schedule.
    pub fn start_health_monitor(self: &Arc<Self>) {
        let interval = self.context.config().health_check_interval();
        let weak = Arc::downgrade(self);
        let handle = self
            .context
            .pool()
            .schedule_periodic("health check round", interval, interval, move || {
                if let Some(service) = weak.upgrade() {
                    service.trigger_health_check_for_all_channels();
                }
            });
        if let Some(previous) = self.health_monitor.lock().replace(handle) {
            previous.cancel();
        }
    }

    pub fn stop_health_monitor(&self) {
        if let Some(handle) = self.health_monitor.lock().take() {
            handle.cancel();
        }
    }

    /// Schedule one probe per registered channel, each after its own random
    /// delay within the configured jitter bound.
    pub fn trigger_health_check_for_all_channels(self: &Arc<Self>) {
        let max_jitter = self.context.config().health_check_max_jitter_ms;
        let ids: Vec<String> = self.channels.lock().keys().cloned().collect();
        let mut rng = rand::thread_rng();
        for id in ids {
            let delay = Duration::from_millis(rng.gen_range(0..=max_jitter));
            let weak = Arc::downgrade(self);
            self.context.pool().schedule_after("health check", delay, move || {
                if let Some(service) = weak.upgrade() {
                    service.perform_health_check(&id);
                }
            });
        }
    }

    /// Probe `channel_id` now, on the calling thread.
    pub fn perform_health_check(&self, channel_id: &str) -> HealthCheckOutcome {
        let (Some(channel), Some(state)) = (
            self.get_channel(channel_id),
            self.health.get(channel_id).map(|s| Arc::clone(s.value())),
        ) else {
            return HealthCheckOutcome::Skipped;
        };
        if !channel.is_established() {
            return HealthCheckOutcome::Skipped;
        }
        let Some(_probe) = state.try_begin_probe() else {
            debug!(channel_id, "Health check already running");
            return HealthCheckOutcome::Skipped;
        };
        let config = self.context.config();
        let healthy = health::probe_channel(&channel, self.local.node_id, config.health_check_timeout());
        if healthy {
            state.record_result(true);
            return HealthCheckOutcome::Healthy;
        }
        counter!("nodelink_health_check_failures_total").increment(1);
        if !state.record_result(false) {
            let consecutive_failures = state.consecutive_failures();
            debug!(channel_id, consecutive_failures, "Health check failed");
            return HealthCheckOutcome::Failed { consecutive_failures };
        }
        warn!(
            channel_id,
            remote = %channel.remote_node(),
            limit = state.failure_limit(),
            "Health check failure limit reached; closing channel as broken"
        );
        self.context.pool().execute("close broken channel", move || {
            channel.mark_broken();
        });
        HealthCheckOutcome::Broken
    }

    /// State and failure counter of every registered channel.
    pub fn health_snapshot(&self) -> Vec<ChannelHealthSnapshot> {
        let channels = self.channels();
        let mut snapshot: Vec<ChannelHealthSnapshot> = channels
            .iter()
            .map(|channel| ChannelHealthSnapshot {
                channel_id: channel.id().to_string(),
                remote_node: channel.remote_node().log_description(),
                direction: channel.direction(),
                state: channel.state(),
                consecutive_failures: self
                    .health
                    .get(channel.id())
                    .map_or(0, |s| s.consecutive_failures()),
            })
            .collect();
        snapshot.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        snapshot
    }

    /// Failure counter of one channel, `None` if it is not registered.
    pub fn consecutive_failures(&self, channel_id: &str) -> Option<u32> {
        self.health.get(channel_id).map(|s| s.consecutive_failures())
    }

    fn on_remote_initiated_channel(&self, channel: Arc<MessageChannel>) {
        if self.is_shutting_down() {
            info!(channel_id = %channel.id(), "Shutting down; closing newly accepted channel");
            channel.close();
            return;
        }
        channel.set_broken_listener(self.transport_adapter.clone());
        if let Err(e) = self.register_channel(Arc::clone(&channel)) {
            warn!(channel_id = %channel.id(), error = %e, "Could not register accepted channel");
            channel.close();
        }
    }
}

/// Bridges transport callbacks to the service without keeping it alive.
struct TransportAdapter {
    service: Weak<MessageChannelService>,
}

impl ChannelEndpointHandler for TransportAdapter {
    fn accepts_connections(&self) -> bool {
        self.service
            .upgrade()
            .map_or(false, |service| !service.is_shutting_down())
    }

    fn exchange_node_information(&self, remote: &NodeIdentity) {
        if let Some(service) = self.service.upgrade() {
            service.node_information.merge(remote);
        }
    }

    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>) {
        match self.service.upgrade() {
            Some(service) => service.on_remote_initiated_channel(channel),
            None => {
                channel.close();
            }
        }
    }

    fn on_inbound_channel_closing(&self, channel_id: &str) {
        if let Some(service) = self.service.upgrade() {
            let closed = service.close_mirror_channels(channel_id);
            debug!(channel_id, closed, "Remote side closed channel");
        }
    }

    fn on_raw_request_received(&self, request: &NetworkRequest, source_channel_id: Option<&str>) -> NetworkResponse {
        match self.service.upgrade() {
            Some(service) => service.handle_incoming_request(request, source_channel_id),
            None => factory::channel_closed_while_waiting(request, NodeId(0)),
        }
    }
}

impl BrokenChannelListener for TransportAdapter {
    fn on_channel_broken(&self, channel_id: &str) {
        if let Some(service) = self.service.upgrade() {
            service.deregister_channel(channel_id);
        }
    }
}

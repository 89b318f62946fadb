//! Channel registry behavior over the in-memory broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use corelib::message::{NetworkRequest, NetworkResponse, ResultCode, MESSAGE_TYPE_HEALTH_CHECK};
use corelib::{CommConfig, CommContext, Error, NodeId, NodeIdentity, Result};
use registry::{
    DirectNeighborRouting, HealthCheckOutcome, MessageChannelLifecycleListener, MessageChannelService,
    MessageChannelTrafficListener,
};
use transport::{ChannelDirection, ChannelState, MemoryBroker, MemoryBrokerRegistry, MessageChannel};

const WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    service: Arc<MessageChannelService>,
    address: String,
    broker: MemoryBroker,
}

impl TestNode {
    fn start(brokers: &MemoryBrokerRegistry, name: &str, config: CommConfig) -> Self {
        let address = format!("mem://{}", name);
        let broker = brokers.create_broker(&address);
        let context = CommContext::new(config).unwrap();
        let identity = NodeIdentity::new(NodeId::random(), name);
        let service = MessageChannelService::new(context, identity, Arc::new(brokers.clone()));
        service.start_server(&address).unwrap();
        Self {
            service,
            address,
            broker,
        }
    }

    fn id(&self) -> NodeId {
        self.service.local_identity().node_id
    }

    fn connect_to(&self, other: &TestNode) -> Arc<MessageChannel> {
        self.service.connect(&other.address).unwrap()
    }
}

fn test_config() -> CommConfig {
    CommConfig {
        handshake_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        health_check_timeout_ms: 100,
        health_check_max_jitter_ms: 20,
        response_retry_count: 2,
        response_retry_interval_ms: 10,
        ..CommConfig::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn register_echo(node: &TestNode) {
    node.service.request_endpoint().register_handler(
        "echo",
        Arc::new(|request: &NetworkRequest| -> Result<Vec<u8>> { Ok(request.content().to_vec()) }),
    );
}

#[derive(Default)]
struct RecordingLifecycle {
    events: Mutex<Vec<String>>,
    terminated: AtomicUsize,
}

impl MessageChannelLifecycleListener for RecordingLifecycle {
    fn set_initial_channels(&self, channels: &[Arc<MessageChannel>]) {
        self.events.lock().push(format!("initial:{}", channels.len()));
    }

    fn on_channel_established(&self, channel: &Arc<MessageChannel>) {
        self.events.lock().push(format!("established:{}", channel.id()));
    }

    fn on_channel_terminated(&self, channel: &Arc<MessageChannel>) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push(format!("terminated:{}", channel.id()));
    }
}

#[derive(Default)]
struct CountingTraffic {
    sent: AtomicUsize,
    received: Mutex<Vec<String>>,
    generated: AtomicUsize,
}

impl MessageChannelTrafficListener for CountingTraffic {
    fn on_request_sent(&self, _request: &NetworkRequest, _channel_id: &str) {
        self.sent.fetch_add(1, Ordering::SeqCst);
    }

    fn on_raw_request_received(&self, request: &NetworkRequest, _source_channel_id: Option<&str>) {
        self.received.lock().push(request.message_type().to_string());
    }

    fn on_raw_response_generated(&self, _response: &NetworkResponse, _request: &NetworkRequest) {
        self.generated.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_connect_registers_channel_on_both_nodes() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());

    let outgoing = a.connect_to(&b);
    assert_eq!(a.service.channel_count(), 1);
    assert_eq!(outgoing.direction(), ChannelDirection::SelfInitiated);
    assert!(wait_until(|| b.service.channel_count() == 1));

    let incoming = b.service.channels().pop().unwrap();
    assert_eq!(incoming.direction(), ChannelDirection::RemoteInitiated);
    assert_eq!(incoming.mirror_channel_id().as_deref(), Some(outgoing.id()));
    assert_eq!(incoming.remote_node().node_id, a.id());
    assert!(b.service.node_information().get(a.id()).is_some());
    assert!(a.service.node_information().get(b.id()).is_some());
    assert!(a.service.find_outgoing_channel_to(b.id()).is_some());
    assert!(b.service.find_outgoing_channel_to(a.id()).is_none());
}

#[test]
fn test_request_reaches_registered_handler() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    register_echo(&b);
    let channel = a.connect_to(&b);

    let request = NetworkRequest::new("echo", vec![1, 2, 3], a.id(), None);
    let response = a
        .service
        .send_request_sync_by_channel_id(channel.id(), request.clone(), Duration::from_secs(2));
    assert!(response.is_success());
    assert_eq!(response.request_id(), request.request_id());
    assert_eq!(response.content(), &[1, 2, 3]);
    assert_eq!(response.metadata().sender(), Some(b.id()));

    let unknown_type = NetworkRequest::new("nope", vec![], a.id(), None);
    let response = a
        .service
        .send_request_sync_by_channel_id(channel.id(), unknown_type, Duration::from_secs(2));
    assert_eq!(response.result_code(), ResultCode::NoHandlerForMessageType);
}

#[test]
fn test_unknown_channel_id_fails_before_sending() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());

    let request = NetworkRequest::new("echo", vec![], a.id(), None);
    let response = a
        .service
        .send_request_sync_by_channel_id("no-such-channel", request, Duration::from_secs(1));
    assert_eq!(response.result_code(), ResultCode::ChannelClosedOrBrokenBeforeSending);
}

#[test]
fn test_failure_limit_breaks_channel_and_deregisters_once() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let channel = a.connect_to(&b);
    let lifecycle = Arc::new(RecordingLifecycle::default());
    a.service.add_lifecycle_listener(lifecycle.clone());

    b.broker.set_drop_messages(true);
    assert_eq!(
        a.service.perform_health_check(channel.id()),
        HealthCheckOutcome::Failed { consecutive_failures: 1 }
    );
    assert_eq!(
        a.service.perform_health_check(channel.id()),
        HealthCheckOutcome::Failed { consecutive_failures: 2 }
    );
    assert_eq!(channel.state(), ChannelState::Established);

    let racer = {
        let service = Arc::clone(&a.service);
        let id = channel.id().to_string();
        std::thread::spawn(move || service.close_channel(&id))
    };
    let outcome = a.service.perform_health_check(channel.id());
    let _ = racer.join();
    assert!(matches!(
        outcome,
        HealthCheckOutcome::Broken | HealthCheckOutcome::Skipped
    ));

    assert!(wait_until(|| a.service.channel_count() == 0));
    assert!(wait_until(|| lifecycle.terminated.load(Ordering::SeqCst) >= 1));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(lifecycle.terminated.load(Ordering::SeqCst), 1);
    assert!(channel.state().is_terminal());
}

#[test]
fn test_failure_limit_without_interference() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let channel = a.connect_to(&b);

    b.broker.set_drop_messages(true);
    for _ in 0..2 {
        assert!(matches!(
            a.service.perform_health_check(channel.id()),
            HealthCheckOutcome::Failed { .. }
        ));
    }
    assert_eq!(a.service.perform_health_check(channel.id()), HealthCheckOutcome::Broken);
    assert!(wait_until(|| channel.state() == ChannelState::Broken));
    assert!(wait_until(|| a.service.get_channel(channel.id()).is_none()));
}

#[test]
fn test_successful_probe_resets_failure_counter() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let channel = a.connect_to(&b);

    b.broker.set_drop_messages(true);
    a.service.perform_health_check(channel.id());
    a.service.perform_health_check(channel.id());
    assert_eq!(a.service.consecutive_failures(channel.id()), Some(2));

    b.broker.set_drop_messages(false);
    assert_eq!(a.service.perform_health_check(channel.id()), HealthCheckOutcome::Healthy);
    assert_eq!(a.service.consecutive_failures(channel.id()), Some(0));
    assert_eq!(channel.state(), ChannelState::Established);

    let snapshot = a.service.health_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].consecutive_failures, 0);
    assert_eq!(snapshot[0].state, ChannelState::Established);
}

#[test]
fn test_health_monitor_probes_periodically() {
    let brokers = MemoryBrokerRegistry::new();
    let config = CommConfig {
        health_check_interval_ms: 100,
        ..test_config()
    };
    let a = TestNode::start(&brokers, "a", config);
    let b = TestNode::start(&brokers, "b", test_config());
    let traffic = Arc::new(CountingTraffic::default());
    b.service.add_traffic_listener(traffic.clone());
    let channel = a.connect_to(&b);

    a.service.start_health_monitor();
    assert!(wait_until(|| {
        traffic
            .received
            .lock()
            .iter()
            .filter(|t| t.as_str() == MESSAGE_TYPE_HEALTH_CHECK)
            .count()
            >= 2
    }));
    a.service.stop_health_monitor();
    assert_eq!(a.service.consecutive_failures(channel.id()), Some(0));
}

#[test]
fn test_non_relay_refuses_to_forward() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let channel = a.connect_to(&b);

    let request = NetworkRequest::new("echo", vec![], a.id(), Some(NodeId::random()));
    let response = a
        .service
        .send_request_sync_by_channel_id(channel.id(), request, Duration::from_secs(2));
    assert_eq!(response.result_code(), ResultCode::NoRouteToDestinationWhileForwarding);
    assert_eq!(response.metadata().sender(), Some(b.id()));
}

#[test]
fn test_relay_forwards_to_final_recipient() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let relay_config = CommConfig {
        is_relay: true,
        ..test_config()
    };
    let b = TestNode::start(&brokers, "b", relay_config);
    let c = TestNode::start(&brokers, "c", test_config());
    register_echo(&c);
    b.service
        .set_routing_service(Arc::new(DirectNeighborRouting::new(Arc::downgrade(&b.service))));
    b.connect_to(&c);
    let channel = a.connect_to(&b);

    let request = NetworkRequest::new("echo", b"via b".to_vec(), a.id(), Some(c.id()));
    let response = a
        .service
        .send_request_sync_by_channel_id(channel.id(), request.clone(), Duration::from_secs(3));
    assert!(response.is_success());
    assert_eq!(response.request_id(), request.request_id());
    assert_eq!(response.content(), b"via b");
    assert_eq!(response.metadata().sender(), Some(c.id()));

    let nowhere = NetworkRequest::new("echo", vec![], a.id(), Some(NodeId::random()));
    let response = a
        .service
        .send_request_sync_by_channel_id(channel.id(), nowhere, Duration::from_secs(3));
    assert_eq!(response.result_code(), ResultCode::NoRouteToDestinationWhileForwarding);
}

#[test]
fn test_lifecycle_listener_sees_initial_channels_first() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let c = TestNode::start(&brokers, "c", test_config());
    let d = TestNode::start(&brokers, "d", test_config());
    a.connect_to(&b);
    a.connect_to(&c);

    let lifecycle = Arc::new(RecordingLifecycle::default());
    a.service.add_lifecycle_listener(lifecycle.clone());
    let third = a.connect_to(&d);
    assert!(a.service.close_channel(third.id()));
    assert!(!a.service.close_channel(third.id()));

    assert!(wait_until(|| lifecycle.events.lock().len() == 3));
    let events = lifecycle.events.lock().clone();
    assert_eq!(
        events,
        vec![
            "initial:2".to_string(),
            format!("established:{}", third.id()),
            format!("terminated:{}", third.id()),
        ]
    );

    let as_dyn: Arc<dyn MessageChannelLifecycleListener> = lifecycle.clone();
    assert!(a.service.remove_lifecycle_listener(&as_dyn));
}

#[test]
fn test_closing_channel_closes_remote_mirror() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    let channel = a.connect_to(&b);
    assert!(wait_until(|| b.service.channel_count() == 1));
    let mirror = b.service.channels().pop().unwrap();

    assert!(a.service.close_channel(channel.id()));
    assert_eq!(a.service.channel_count(), 0);
    assert!(wait_until(|| b.service.channel_count() == 0));
    assert_eq!(mirror.state(), ChannelState::Closed);
}

#[test]
fn test_traffic_listener_observes_requests() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    register_echo(&b);
    let sent = Arc::new(CountingTraffic::default());
    let received = Arc::new(CountingTraffic::default());
    a.service.add_traffic_listener(sent.clone());
    b.service.add_traffic_listener(received.clone());
    let channel = a.connect_to(&b);

    for _ in 0..3 {
        let request = NetworkRequest::new("echo", vec![9], a.id(), None);
        let response = a
            .service
            .send_request_sync_by_channel_id(channel.id(), request, Duration::from_secs(2));
        assert!(response.is_success());
    }
    assert!(wait_until(|| sent.sent.load(Ordering::SeqCst) == 3));
    assert!(wait_until(|| received.generated.load(Ordering::SeqCst) == 3));
    assert_eq!(received.received.lock().len(), 3);
}

#[test]
fn test_shutdown_closes_channels_and_rejects_connects() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    a.connect_to(&b);
    assert!(wait_until(|| b.service.channel_count() == 1));

    a.service.shutdown();
    assert_eq!(a.service.channel_count(), 0);
    assert!(matches!(a.service.connect(&b.address), Err(Error::ChannelState(_))));
    assert!(wait_until(|| b.service.channel_count() == 0));
}

#[test]
fn test_handshake_during_shutdown_registers_nothing() {
    let brokers = MemoryBrokerRegistry::new();
    let a = TestNode::start(&brokers, "a", test_config());
    let b = TestNode::start(&brokers, "b", test_config());
    b.service.set_shutdown_flag(true);

    assert!(matches!(a.service.connect(&b.address), Err(Error::Protocol(_))));
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a.service.channel_count(), 0);
    assert_eq!(b.service.channel_count(), 0);
    assert!(b.service.node_information().get(a.id()).is_none());
}

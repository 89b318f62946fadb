//! In-process broker.
//!
//! Each node of an in-process mesh owns one [`MemoryBroker`]; a shared
//! [`MemoryBrokerRegistry`] resolves broker addresses the way a network
//! connector would resolve host names. Named queues are created on first
//! use, temporary queues belong to their connection.
//!
//! Failure injection switches (`set_refuse_connections`,
//! `set_drop_messages`, `set_fail_sends`) let tests simulate unreachable
//! brokers, silently lost messages and failing sends.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use corelib::{Error, Result};

use super::{BrokerConnection, BrokerConnector, BrokerMessage, BrokerSession};

const TEMP_QUEUE_PREFIX: &str = "temp://";

/// How long a blocked receive waits before re-checking for end-of-stream.
const RECEIVE_POLL: Duration = Duration::from_millis(20);

struct MemoryQueue {
    sender: Sender<BrokerMessage>,
    receiver: Receiver<BrokerMessage>,
    deleted: AtomicBool,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        let (sender, receiver) = channel::unbounded();
        Arc::new(Self {
            sender,
            receiver,
            deleted: AtomicBool::new(false),
        })
    }
}

struct BrokerState {
    address: String,
    queues: DashMap<String, Arc<MemoryQueue>>,
    next_message_id: AtomicU64,
    next_temp_queue: AtomicU64,
    refuse_connections: AtomicBool,
    drop_messages: AtomicBool,
    fail_sends: AtomicBool,
}

impl BrokerState {
    fn lookup(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        if let Some(queue) = self.queues.get(name) {
            return Some(Arc::clone(queue.value()));
        }
        if name.starts_with(TEMP_QUEUE_PREFIX) {
            return None;
        }
        Some(Arc::clone(
            self.queues.entry(name.to_string()).or_insert_with(MemoryQueue::new).value(),
        ))
    }

    fn delete(&self, name: &str) {
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.deleted.store(true, Ordering::SeqCst);
            trace!(broker = %self.address, queue = name, "Queue deleted");
        }
    }
}

/// A single in-memory broker instance.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            state: Arc::new(BrokerState {
                address: address.into(),
                queues: DashMap::new(),
                next_message_id: AtomicU64::new(1),
                next_temp_queue: AtomicU64::new(1),
                refuse_connections: AtomicBool::new(false),
                drop_messages: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.state.address
    }

    pub fn open_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("connection to {} refused", self.state.address)));
        }
        Ok(Arc::new(MemoryConnection {
            state: Arc::new(ConnectionState {
                broker: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
                temp_queues: Mutex::new(Vec::new()),
                sessions: Mutex::new(Vec::new()),
            }),
        }))
    }

    /// Refuse new connections; existing ones stay open.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Accept sends but silently discard the messages.
    pub fn set_drop_messages(&self, drop: bool) {
        self.state.drop_messages.store(drop, Ordering::SeqCst);
    }

    /// Make every send fail with a transport error.
    pub fn set_fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.contains_key(name)
    }

    /// Number of messages waiting in `name`.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state.queues.get(name).map_or(0, |q| q.receiver.len())
    }

    pub fn temporary_queue_count(&self) -> usize {
        self.state
            .queues
            .iter()
            .filter(|entry| entry.key().starts_with(TEMP_QUEUE_PREFIX))
            .count()
    }
}

/// Address → broker lookup acting as the connector of an in-process mesh.
#[derive(Clone, Default)]
pub struct MemoryBrokerRegistry {
    brokers: Arc<DashMap<String, MemoryBroker>>,
}

impl MemoryBrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the broker listening on `address`, creating it if needed.
    pub fn create_broker(&self, address: &str) -> MemoryBroker {
        self.brokers
            .entry(address.to_string())
            .or_insert_with(|| MemoryBroker::new(address))
            .value()
            .clone()
    }

    pub fn broker(&self, address: &str) -> Option<MemoryBroker> {
        self.brokers.get(address).map(|b| b.value().clone())
    }

    /// Unregister a broker; later connects to its address are refused.
    pub fn remove_broker(&self, address: &str) -> Option<MemoryBroker> {
        self.brokers.remove(address).map(|(_, broker)| broker)
    }
}

impl BrokerConnector for MemoryBrokerRegistry {
    fn connect(&self, address: &str) -> Result<Arc<dyn BrokerConnection>> {
        let broker = self
            .broker(address)
            .ok_or_else(|| Error::Transport(format!("connection refused: no broker at {}", address)))?;
        broker.open_connection()
    }
}

struct ConnectionState {
    broker: Arc<BrokerState>,
    closed: AtomicBool,
    temp_queues: Mutex<Vec<String>>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
}

struct MemoryConnection {
    state: Arc<ConnectionState>,
}

impl BrokerConnection for MemoryConnection {
    fn create_session(&self) -> Result<Arc<dyn BrokerSession>> {
        if self.is_closed() {
            return Err(Error::Transport("connection is closed".into()));
        }
        let session = Arc::new(MemorySession {
            connection: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        });
        let mut sessions = self.state.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        Ok(session)
    }

    fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for session in self.state.sessions.lock().drain(..) {
            if let Some(session) = session.upgrade() {
                session.closed.store(true, Ordering::SeqCst);
            }
        }
        let queues: Vec<String> = self.state.temp_queues.lock().drain(..).collect();
        for queue in &queues {
            self.state.broker.delete(queue);
        }
        debug!(broker = %self.state.broker.address, temp_queues = queues.len(), "Connection closed");
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

struct MemorySession {
    connection: Arc<ConnectionState>,
    closed: AtomicBool,
}

impl MemorySession {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.connection.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Transport("session is closed".into()))
        }
    }

    /// Wait up to `timeout` for a message. `Err(())` means end-of-stream.
    fn poll(&self, queue: &str, timeout: Duration) -> std::result::Result<Option<BrokerMessage>, ()> {
        if !self.is_open() {
            return Err(());
        }
        let Some(q) = self.connection.broker.lookup(queue) else {
            return Err(());
        };
        if q.deleted.load(Ordering::SeqCst) {
            return Err(());
        }
        match q.receiver.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(()),
        }
    }
}

impl BrokerSession for MemorySession {
    fn create_temporary_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let broker = &self.connection.broker;
        let name = format!(
            "{}{}/{}",
            TEMP_QUEUE_PREFIX,
            broker.address,
            broker.next_temp_queue.fetch_add(1, Ordering::SeqCst)
        );
        broker.queues.insert(name.clone(), MemoryQueue::new());
        self.connection.temp_queues.lock().push(name.clone());
        Ok(name)
    }

    fn delete_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.connection.temp_queues.lock().retain(|q| q != queue);
        self.connection.broker.delete(queue);
        Ok(())
    }

    fn send(&self, queue: &str, mut message: BrokerMessage) -> Result<String> {
        self.ensure_open()?;
        let broker = &self.connection.broker;
        if broker.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("send to {} failed", queue)));
        }
        let target = broker
            .lookup(queue)
            .ok_or_else(|| Error::Transport(format!("queue {} does not exist", queue)))?;
        let message_id = format!("ID:{}:{}", broker.address, broker.next_message_id.fetch_add(1, Ordering::SeqCst));
        if broker.drop_messages.load(Ordering::SeqCst) {
            trace!(queue, message_id = %message_id, "Dropping message");
            return Ok(message_id);
        }
        message.message_id = Some(message_id.clone());
        target
            .sender
            .send(message)
            .map_err(|_| Error::Transport(format!("queue {} is gone", queue)))?;
        Ok(message_id)
    }

    fn receive(&self, queue: &str) -> Result<Option<BrokerMessage>> {
        loop {
            match self.poll(queue, RECEIVE_POLL) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(()) => return Ok(None),
            }
        }
    }

    fn receive_timeout(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.poll(queue, remaining.min(RECEIVE_POLL)) {
                Ok(Some(message)) => return Ok(Some(message)),
                Ok(None) => continue,
                Err(()) => return Err(Error::Transport(format!("end of stream on {}", queue))),
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

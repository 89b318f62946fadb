//! Generic queue consumer loop.
//!
//! One dedicated thread per queue performs blocking receives and hands every
//! message to a [`MessageHandler`]. Handler errors are logged and the loop
//! keeps going. The loop stops on the shutdown sentinel, at end-of-stream or
//! on a receive error.
//!
//! The consumer moves through `Starting → Running → Stopping → Stopped`. The
//! state is checked before each blocking receive and again right after it
//! returns. The session is released exactly once, whether the loop ends on
//! its own or because of [`QueueConsumer::trigger_shutdown`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use corelib::{Error, Result, WorkerPool};

use crate::broker::{BrokerConnection, BrokerMessage, BrokerSession};
use crate::protocol::{self, WireMessageType};

/// Receives the messages of one queue.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, message: BrokerMessage) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsumerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ConsumerState {
    /// Started and not asked to stop. A consumer is `Starting` until its
    /// thread first runs.
    pub fn is_active(self) -> bool {
        matches!(self, ConsumerState::Starting | ConsumerState::Running)
    }
}

struct ConsumerInner {
    name: String,
    queue: String,
    connection: Arc<dyn BrokerConnection>,
    handler: Arc<dyn MessageHandler>,
    pool: WorkerPool,
    state: Mutex<ConsumerState>,
    stopped: Condvar,
    session: Mutex<Option<Arc<dyn BrokerSession>>>,
}

impl ConsumerInner {
    fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    fn release_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
            trace!(consumer = %self.name, "Consumer session released");
        }
    }

    fn run(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConsumerState::Starting {
                *state = ConsumerState::Running;
            }
        }
        debug!(consumer = %self.name, queue = %self.queue, "Queue consumer started");
        loop {
            if self.state() != ConsumerState::Running {
                break;
            }
            let Some(session) = self.session.lock().clone() else {
                break;
            };
            let message = match session.receive(&self.queue) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    debug!(consumer = %self.name, "End of stream; stopping consumer");
                    break;
                }
                Err(e) => {
                    if self.state() == ConsumerState::Running {
                        warn!(consumer = %self.name, error = %e, "Receive failed; stopping consumer");
                    }
                    break;
                }
            };
            if self.state() != ConsumerState::Running {
                trace!(consumer = %self.name, "Discarding message received while stopping");
                break;
            }
            if WireMessageType::of(&message) == Some(WireMessageType::ShutdownQueue) {
                debug!(consumer = %self.name, "Shutdown sentinel received");
                break;
            }
            if let Err(e) = self.handler.handle_message(message) {
                warn!(consumer = %self.name, error = %e, "Error while handling message");
            }
        }
        self.release_session();
        *self.state.lock() = ConsumerState::Stopped;
        self.stopped.notify_all();
        debug!(consumer = %self.name, "Queue consumer stopped");
    }

    fn send_sentinel(&self) -> Result<()> {
        let session = self.connection.create_session()?;
        let result = session.send(&self.queue, protocol::shutdown_queue_sentinel());
        session.close();
        result.map(|_| ())
    }
}

/// Handle to a running consumer thread.
#[derive(Clone)]
pub struct QueueConsumer {
    inner: Arc<ConsumerInner>,
}

impl QueueConsumer {
    /// Open a session on `connection` and start consuming `queue` on a new
    /// thread named `name`.
    pub fn start(
        name: impl Into<String>,
        connection: Arc<dyn BrokerConnection>,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        pool: WorkerPool,
    ) -> Result<Self> {
        let session = connection.create_session()?;
        let inner = Arc::new(ConsumerInner {
            name: name.into(),
            queue: queue.into(),
            connection,
            handler,
            pool,
            state: Mutex::new(ConsumerState::Starting),
            stopped: Condvar::new(),
            session: Mutex::new(Some(session)),
        });
        let runner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || runner.run())
            .map_err(|e| {
                inner.release_session();
                *inner.state.lock() = ConsumerState::Stopped;
                Error::Transport(format!("cannot start consumer thread: {}", e))
            })?;
        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn queue(&self) -> &str {
        &self.inner.queue
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.state()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state().is_active()
    }

    /// Ask the loop to stop without waiting for it.
    ///
    /// The sentinel is sent from the worker pool; if that fails the session
    /// is released directly, which ends the blocking receive.
    pub fn trigger_shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ConsumerState::Starting | ConsumerState::Running => *state = ConsumerState::Stopping,
                ConsumerState::Stopping | ConsumerState::Stopped => return,
            }
        }
        let inner = Arc::clone(&self.inner);
        let queued = self.inner.pool.execute("consumer shutdown", move || {
            if let Err(e) = inner.send_sentinel() {
                debug!(consumer = %inner.name, error = %e, "Could not send shutdown sentinel; releasing session");
                inner.release_session();
            }
        });
        if !queued {
            self.inner.release_session();
        }
    }

    /// Wait until the loop has exited. Returns `false` on timeout.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while *state != ConsumerState::Stopped {
            if self.inner.stopped.wait_until(&mut state, deadline).timed_out() {
                return *state == ConsumerState::Stopped;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use corelib::pool::PoolConfig;
    use crossbeam::channel::{self, Sender};

    struct Forward(Sender<Vec<u8>>);

    impl MessageHandler for Forward {
        fn handle_message(&self, message: BrokerMessage) -> Result<()> {
            if message.body == b"bad" {
                return Err(Error::Protocol("bad message".into()));
            }
            let _ = self.0.send(message.body);
            Ok(())
        }
    }

    fn setup() -> (MemoryBroker, Arc<dyn BrokerConnection>, WorkerPool) {
        let broker = MemoryBroker::new("mem://c");
        let connection = broker.open_connection().unwrap();
        (broker, connection, WorkerPool::new(PoolConfig::default()))
    }

    #[test]
    fn test_handler_errors_do_not_stop_loop() {
        let (_broker, connection, pool) = setup();
        let (tx, rx) = channel::unbounded();
        let consumer = QueueConsumer::start("c1", Arc::clone(&connection), "q", Arc::new(Forward(tx)), pool).unwrap();

        let session = connection.create_session().unwrap();
        session.send("q", BrokerMessage::new(b"bad".to_vec())).unwrap();
        session.send("q", BrokerMessage::new(b"good".to_vec())).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"good".to_vec());
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.trigger_shutdown();
        assert!(consumer.wait_stopped(Duration::from_secs(2)));
    }

    #[test]
    fn test_consumer_is_active_as_soon_as_started() {
        let (_broker, connection, pool) = setup();
        let (tx, _rx) = channel::unbounded();
        let consumer = QueueConsumer::start("c5", connection, "q", Arc::new(Forward(tx)), pool).unwrap();
        assert!(consumer.is_active());
        consumer.trigger_shutdown();
        assert!(!consumer.is_active());
        assert!(consumer.wait_stopped(Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (_broker, connection, pool) = setup();
        let (tx, _rx) = channel::unbounded();
        let consumer = QueueConsumer::start("c2", connection, "q", Arc::new(Forward(tx)), pool).unwrap();
        consumer.trigger_shutdown();
        consumer.trigger_shutdown();
        assert!(consumer.wait_stopped(Duration::from_secs(2)));
        consumer.trigger_shutdown();
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[test]
    fn test_stops_at_end_of_stream() {
        let (_broker, connection, pool) = setup();
        let (tx, _rx) = channel::unbounded();
        let session = connection.create_session().unwrap();
        let temp = session.create_temporary_queue().unwrap();
        let consumer = QueueConsumer::start("c3", Arc::clone(&connection), temp, Arc::new(Forward(tx)), pool).unwrap();
        connection.close();
        assert!(consumer.wait_stopped(Duration::from_secs(2)));
    }

    #[test]
    fn test_sentinel_stops_loop_without_trigger() {
        let (_broker, connection, pool) = setup();
        let (tx, rx) = channel::unbounded();
        let consumer = QueueConsumer::start("c4", Arc::clone(&connection), "q", Arc::new(Forward(tx)), pool).unwrap();
        let session = connection.create_session().unwrap();
        session.send("q", protocol::shutdown_queue_sentinel()).unwrap();
        assert!(consumer.wait_stopped(Duration::from_secs(2)));
        session.send("q", BrokerMessage::new(b"late".to_vec())).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}

//! Ordered asynchronous callback delivery.
//!
//! # Guarantees
//!
//! - Each listener receives every callback enqueued to it in exact enqueue
//!   order, with at most one callback per listener in flight.
//! - Different listeners are served in parallel on the shared
//!   [`WorkerPool`]; there is no ordering across listeners.
//! - Enqueueing never blocks on listener code.
//!
//! # Mechanism
//!
//! Every listener owns a FIFO of pending callbacks. When the first callback
//! is queued, a dispatch task is started on the pool; it runs one callback,
//! then either re-submits itself (more pending) or marks the queue idle.
//!
//! A callback that panics is handled according to the manager's
//! [`CallbackExceptionPolicy`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::pool::stats::panic_message;
use crate::pool::WorkerPool;

/// What happens after a callback panicked.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CallbackExceptionPolicy {
    /// Log the panic and continue delivering to the listener.
    LogAndProceed,
    /// Log the panic, discard the listener's queue and never deliver to it
    /// again.
    LogAndCancelListener,
}

/// A callback applied to every listener it is enqueued for.
pub type Callback<L> = Arc<dyn Fn(&L) + Send + Sync>;

struct QueueState<L: ?Sized> {
    pending: VecDeque<Callback<L>>,
    dispatching: bool,
    cancelled: bool,
}

struct ListenerQueue<L: ?Sized> {
    listener: Arc<L>,
    state: Mutex<QueueState<L>>,
}

impl<L: ?Sized + Send + Sync + 'static> ListenerQueue<L> {
    fn new(listener: Arc<L>) -> Self {
        Self {
            listener,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                dispatching: false,
                cancelled: false,
            }),
        }
    }

    /// Append a callback; returns `true` if a dispatch task must be started.
    fn push(&self, callback: Callback<L>) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return false;
        }
        state.pending.push_back(callback);
        if state.dispatching {
            false
        } else {
            state.dispatching = true;
            true
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

/// Delivers callbacks to a set of listeners, preserving per-listener order.
pub struct AsyncOrderedCallbackManager<L: ?Sized> {
    pool: WorkerPool,
    policy: CallbackExceptionPolicy,
    listeners: Mutex<Vec<Arc<ListenerQueue<L>>>>,
}

impl<L: ?Sized + Send + Sync + 'static> AsyncOrderedCallbackManager<L> {
    pub fn new(pool: WorkerPool, policy: CallbackExceptionPolicy) -> Self {
        Self {
            pool,
            policy,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_listener(&self, listener: Arc<L>) {
        self.listeners.lock().push(Arc::new(ListenerQueue::new(listener)));
    }

    /// Add a listener and queue `initial` as its first callback, atomically:
    /// no callback enqueued concurrently can overtake `initial`.
    pub fn add_listener_and_enqueue_callback<F>(&self, listener: Arc<L>, initial: F)
    where
        F: Fn(&L) + Send + Sync + 'static,
    {
        let queue = Arc::new(ListenerQueue::new(listener));
        let mut listeners = self.listeners.lock();
        if queue.push(Arc::new(initial)) {
            self.start_dispatch(Arc::clone(&queue));
        }
        listeners.push(queue);
    }

    /// Remove a listener. Callbacks already queued for it are discarded,
    /// a callback currently running completes.
    pub fn remove_listener(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|queue| {
            if same_listener(&queue.listener, listener) {
                let mut state = queue.state.lock();
                state.cancelled = true;
                state.pending.clear();
                false
            } else {
                true
            }
        });
        listeners.len() != before
    }

    /// Enqueue `callback` for every current listener.
    pub fn enqueue_callback<F>(&self, callback: F)
    where
        F: Fn(&L) + Send + Sync + 'static,
    {
        let callback: Callback<L> = Arc::new(callback);
        let mut listeners = self.listeners.lock();
        listeners.retain(|queue| !queue.is_cancelled());
        for queue in listeners.iter() {
            if queue.push(Arc::clone(&callback)) {
                self.start_dispatch(Arc::clone(queue));
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().iter().filter(|queue| !queue.is_cancelled()).count()
    }

    fn start_dispatch(&self, queue: Arc<ListenerQueue<L>>) {
        let pool = self.pool.clone();
        let policy = self.policy;
        if !self.pool.execute("Ordered callback dispatch", move || dispatch_next(pool, policy, queue)) {
            debug!("Pool rejected callback dispatch; callbacks stay queued");
        }
    }
}

fn dispatch_next<L: ?Sized + Send + Sync + 'static>(
    pool: WorkerPool,
    policy: CallbackExceptionPolicy,
    queue: Arc<ListenerQueue<L>>,
) {
    let next = {
        let mut state = queue.state.lock();
        match state.pending.pop_front() {
            Some(callback) if !state.cancelled => callback,
            _ => {
                state.dispatching = false;
                return;
            }
        }
    };

    let listener = Arc::clone(&queue.listener);
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| next(&*listener)));

    let more = {
        let mut state = queue.state.lock();
        if let Err(payload) = outcome {
            let message = panic_message(payload.as_ref());
            match policy {
                CallbackExceptionPolicy::LogAndProceed => {
                    error!(panic = %message, "Listener callback panicked; continuing delivery");
                }
                CallbackExceptionPolicy::LogAndCancelListener => {
                    error!(
                        panic = %message,
                        discarded = state.pending.len(),
                        "Listener callback panicked; listener will receive no further callbacks"
                    );
                    state.cancelled = true;
                    state.pending.clear();
                }
            }
        }
        if state.pending.is_empty() || state.cancelled {
            state.dispatching = false;
            false
        } else {
            true
        }
    };

    if more {
        let next_pool = pool.clone();
        let requeued = pool.execute("Ordered callback dispatch", move || dispatch_next(next_pool, policy, queue));
        if !requeued {
            debug!("Pool rejected callback re-dispatch");
        }
    }
}

fn same_listener<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crossbeam::channel::{self, Sender};
    use std::time::Duration;

    trait Recorder: Send + Sync {
        fn record(&self, value: u32);
    }

    struct ChannelRecorder {
        tx: Sender<u32>,
        slow_first: bool,
    }

    impl Recorder for ChannelRecorder {
        fn record(&self, value: u32) {
            if self.slow_first && value == 0 {
                std::thread::sleep(Duration::from_millis(200));
            }
            let _ = self.tx.send(value);
        }
    }

    struct PanickingRecorder {
        tx: Sender<u32>,
    }

    impl Recorder for PanickingRecorder {
        fn record(&self, value: u32) {
            if value == 1 {
                panic!("expected test panic");
            }
            let _ = self.tx.send(value);
        }
    }

    fn pool() -> WorkerPool {
        WorkerPool::new(PoolConfig {
            name: "callback-test".into(),
            core_threads: 2,
            max_threads: 16,
            idle_timeout: Duration::from_millis(200),
        })
    }

    fn drain(rx: &channel::Receiver<u32>, n: usize) -> Vec<u32> {
        (0..n).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect()
    }

    #[test]
    fn test_per_listener_order_is_enqueue_order() {
        let manager: AsyncOrderedCallbackManager<dyn Recorder> =
            AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndProceed);
        let (tx, rx) = channel::unbounded();
        manager.add_listener(Arc::new(ChannelRecorder { tx, slow_first: true }));

        for i in 0..50u32 {
            manager.enqueue_callback(move |l| l.record(i));
        }
        assert_eq!(drain(&rx, 50), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_listeners_are_served_independently() {
        let manager: AsyncOrderedCallbackManager<dyn Recorder> =
            AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndProceed);
        let (slow_tx, slow_rx) = channel::unbounded();
        let (fast_tx, fast_rx) = channel::unbounded();
        manager.add_listener(Arc::new(ChannelRecorder { tx: slow_tx, slow_first: true }));
        manager.add_listener(Arc::new(ChannelRecorder { tx: fast_tx, slow_first: false }));

        manager.enqueue_callback(|l| l.record(0));
        manager.enqueue_callback(|l| l.record(1));

        // the fast listener is not held back by the slow one
        assert_eq!(drain(&fast_rx, 2), vec![0, 1]);
        assert!(slow_rx.try_recv().is_err());
        assert_eq!(drain(&slow_rx, 2), vec![0, 1]);
    }

    #[test]
    fn test_cancel_policy_stops_delivery() {
        let manager: AsyncOrderedCallbackManager<dyn Recorder> =
            AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndCancelListener);
        let (tx, rx) = channel::unbounded();
        manager.add_listener(Arc::new(PanickingRecorder { tx }));

        for i in 0..4u32 {
            manager.enqueue_callback(move |l| l.record(i));
        }
        assert_eq!(drain(&rx, 1), vec![0]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(manager.listener_count(), 0);
    }

    #[test]
    fn test_proceed_policy_skips_only_failed_callback() {
        let manager: AsyncOrderedCallbackManager<dyn Recorder> =
            AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndProceed);
        let (tx, rx) = channel::unbounded();
        manager.add_listener(Arc::new(PanickingRecorder { tx }));

        for i in 0..4u32 {
            manager.enqueue_callback(move |l| l.record(i));
        }
        assert_eq!(drain(&rx, 3), vec![0, 2, 3]);
    }

    #[test]
    fn test_initial_callback_comes_first() {
        let manager: Arc<AsyncOrderedCallbackManager<dyn Recorder>> =
            Arc::new(AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndProceed));
        let (tx, rx) = channel::unbounded();

        let background = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                for i in 1..100u32 {
                    manager.enqueue_callback(move |l| l.record(i));
                }
            })
        };
        manager.add_listener_and_enqueue_callback(
            Arc::new(ChannelRecorder { tx, slow_first: false }),
            |l| l.record(0),
        );
        background.join().unwrap();

        let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, 0);
        let mut last = 0;
        while let Ok(value) = rx.recv_timeout(Duration::from_millis(200)) {
            assert!(value > last);
            last = value;
        }
    }

    #[test]
    fn test_remove_listener() {
        let manager: AsyncOrderedCallbackManager<dyn Recorder> =
            AsyncOrderedCallbackManager::new(pool(), CallbackExceptionPolicy::LogAndProceed);
        let (tx, rx) = channel::unbounded();
        let listener: Arc<dyn Recorder> = Arc::new(ChannelRecorder { tx, slow_first: false });
        manager.add_listener(Arc::clone(&listener));
        assert!(manager.remove_listener(&listener));
        assert!(!manager.remove_listener(&listener));
        manager.enqueue_callback(|l| l.record(1));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}

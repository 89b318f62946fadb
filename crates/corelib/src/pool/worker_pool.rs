//! Elastic worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::CommConfig;
use crate::pool::handle::{ScheduledHandle, TaskHandle};
use crate::pool::stats::TaskStatistics;
use crate::pool::timer::Timer;
use crate::pool::Job;

/// Sizing of a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Prefix of worker thread names.
    pub name: String,
    /// Threads that never retire once started.
    pub core_threads: usize,
    /// Upper bound of concurrently running threads; further tasks queue.
    pub max_threads: usize,
    /// Idle time after which a thread above the core size retires.
    pub idle_timeout: Duration,
}

impl PoolConfig {
    pub fn from_comm_config(name: impl Into<String>, config: &CommConfig) -> Self {
        Self {
            name: name.into(),
            core_threads: config.worker_pool_core_threads,
            max_threads: config.worker_pool_max_threads,
            idle_timeout: config.worker_idle_timeout(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::from_comm_config("worker", &CommConfig::default())
    }
}

enum Message {
    Run(Job),
    Stop,
}

#[derive(Default)]
struct ThreadState {
    threads: usize,
    /// Threads waiting for (or about to take) the next message.
    idle: usize,
    /// Tasks sent but not yet picked up.
    queued: usize,
    shutdown: bool,
}

struct PoolShared {
    config: PoolConfig,
    receiver: Receiver<Message>,
    state: Mutex<ThreadState>,
    stats: TaskStatistics,
    thread_seq: AtomicUsize,
}

pub(crate) struct PoolInner {
    sender: Sender<Message>,
    shared: Arc<PoolShared>,
    timer: Timer,
}

/// Shared, elastically sized task execution substrate.
///
/// Cheap to clone; all clones share the same threads. Tasks are grouped by a
/// static description for statistics. A panicking task is logged and counted
/// but never takes a worker thread down.
///
/// # Example
///
/// ```rust
/// use corelib::pool::{PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default());
/// let handle = pool.submit("Compute answer", || 6 * 7);
/// assert_eq!(handle.wait().unwrap(), 42);
/// pool.shutdown();
/// ```
#[derive(Clone)]
pub struct WorkerPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(PoolShared {
            config,
            receiver,
            state: Mutex::new(ThreadState::default()),
            stats: TaskStatistics::default(),
            thread_seq: AtomicUsize::new(0),
        });
        Self {
            inner: Arc::new(PoolInner {
                sender,
                shared,
                timer: Timer::new(),
            }),
        }
    }

    /// Run `task` asynchronously.
    ///
    /// Returns `false` if the pool has been shut down and the task was
    /// discarded.
    pub fn execute<F>(&self, description: &'static str, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = Arc::clone(&self.inner.shared);
        let job: Job = Box::new(move || {
            let _ = shared.stats.run_tracked(description, task);
        });
        self.dispatch(description, job)
    }

    /// Run `task` asynchronously and return a handle to wait for its result.
    pub fn submit<T, F>(&self, description: &'static str, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = channel::bounded(1);
        let shared = Arc::clone(&self.inner.shared);
        let job: Job = Box::new(move || {
            let result = shared.stats.run_tracked(description, task);
            let _ = tx.send(result);
        });
        self.dispatch(description, job);
        TaskHandle { receiver: rx }
    }

    /// Run `task` on the pool once `delay` has elapsed.
    pub fn schedule_after<F>(&self, description: &'static str, delay: Duration, task: F) -> ScheduledHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = ScheduledHandle::new();
        self.inner
            .timer
            .schedule_once(Arc::downgrade(&self.inner), description, delay, Box::new(task), handle.flag());
        handle
    }

    /// Run `task` on the pool every `period`, starting after `initial_delay`.
    pub fn schedule_periodic<F>(
        &self,
        description: &'static str,
        initial_delay: Duration,
        period: Duration,
        task: F,
    ) -> ScheduledHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = ScheduledHandle::new();
        self.inner.timer.schedule_periodic(
            Arc::downgrade(&self.inner),
            description,
            initial_delay,
            period,
            Arc::new(task),
            handle.flag(),
        );
        handle
    }

    /// Stop accepting tasks. Already queued tasks still run; idle threads
    /// exit afterwards and pending timer entries are dropped.
    pub fn shutdown(&self) {
        let threads = {
            let mut state = self.inner.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.threads
        };
        self.inner.timer.shutdown();
        for _ in 0..threads {
            let _ = self.inner.sender.send(Message::Stop);
        }
        debug!(pool = %self.inner.shared.config.name, threads, "Worker pool shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shared.state.lock().shutdown
    }

    pub fn thread_count(&self) -> usize {
        self.inner.shared.state.lock().threads
    }

    pub fn statistics(&self) -> &TaskStatistics {
        &self.inner.shared.stats
    }

    /// Formatted per-task-class statistics.
    pub fn statistics_report(&self) -> String {
        self.inner.shared.stats.format_report()
    }

    fn dispatch(&self, description: &'static str, job: Job) -> bool {
        let shared = &self.inner.shared;
        let spawn_worker = {
            let mut state = shared.state.lock();
            if state.shutdown {
                warn!(task = description, "Worker pool is shut down; discarding task");
                return false;
            }
            if self.inner.sender.send(Message::Run(job)).is_err() {
                return false;
            }
            state.queued += 1;
            if state.queued > state.idle && state.threads < shared.config.max_threads {
                state.threads += 1;
                state.idle += 1;
                true
            } else {
                false
            }
        };
        if spawn_worker {
            spawn_worker_thread(Arc::clone(shared));
        }
        true
    }
}

/// Hand a due timer entry to its pool.
pub(crate) fn dispatch_timer_job(inner: &Arc<PoolInner>, description: &'static str, job: Job) {
    let pool = WorkerPool {
        inner: Arc::clone(inner),
    };
    let shared = Arc::clone(&inner.shared);
    pool.dispatch(
        description,
        Box::new(move || {
            let _ = shared.stats.run_tracked(description, job);
        }),
    );
}

fn spawn_worker_thread(shared: Arc<PoolShared>) {
    let seq = shared.thread_seq.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{}", shared.config.name, seq);
    let worker_shared = Arc::clone(&shared);
    let spawned = std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(worker_shared));
    if let Err(e) = spawned {
        error!(thread = %name, error = %e, "Failed to spawn worker thread");
        let mut state = shared.state.lock();
        state.threads -= 1;
        state.idle -= 1;
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    let idle_timeout = shared.config.idle_timeout;
    loop {
        match shared.receiver.recv_timeout(idle_timeout) {
            Ok(Message::Run(job)) => {
                {
                    let mut state = shared.state.lock();
                    state.idle -= 1;
                    state.queued -= 1;
                }
                job();
                shared.state.lock().idle += 1;
            }
            Ok(Message::Stop) | Err(RecvTimeoutError::Disconnected) => {
                retire(&shared);
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let mut state = shared.state.lock();
                if state.queued == 0 && (state.threads > shared.config.core_threads || state.shutdown) {
                    state.threads -= 1;
                    state.idle -= 1;
                    return;
                }
            }
        }
    }
}

fn retire(shared: &PoolShared) {
    let mut state = shared.state.lock();
    state.threads -= 1;
    state.idle -= 1;
}

//! Delayed and periodic task scheduling.
//!
//! A single timer thread per pool keeps a min-heap of due times. It never
//! runs tasks itself; due entries are handed to the pool's workers. The
//! thread is started lazily and holds only a weak reference to the pool, so
//! it exits once the pool is dropped or shut down.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, trace};

use crate::pool::worker_pool::{dispatch_timer_job, PoolInner};
use crate::pool::Job;

/// Longest time the timer thread parks before re-checking pool liveness.
const MAX_TIMER_PARK: Duration = Duration::from_millis(250);

enum TimerTask {
    Once(Job),
    Periodic {
        task: Arc<dyn Fn() + Send + Sync>,
        period: Duration,
    },
}

struct TimerEntry {
    due: Instant,
    seq: u64,
    description: &'static str,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
    thread_started: bool,
    shutdown: bool,
}

#[derive(Default)]
struct TimerShared {
    queue: Mutex<TimerQueue>,
    wakeup: Condvar,
}

pub(crate) struct Timer {
    shared: Arc<TimerShared>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared::default()),
        }
    }

    pub(crate) fn schedule_once(
        &self,
        pool: Weak<PoolInner>,
        description: &'static str,
        delay: Duration,
        job: Job,
        cancelled: Arc<AtomicBool>,
    ) {
        self.insert(pool, description, Instant::now() + delay, cancelled, TimerTask::Once(job));
    }

    pub(crate) fn schedule_periodic(
        &self,
        pool: Weak<PoolInner>,
        description: &'static str,
        initial_delay: Duration,
        period: Duration,
        task: Arc<dyn Fn() + Send + Sync>,
        cancelled: Arc<AtomicBool>,
    ) {
        self.insert(
            pool,
            description,
            Instant::now() + initial_delay,
            cancelled,
            TimerTask::Periodic { task, period },
        );
    }

    pub(crate) fn shutdown(&self) {
        let mut queue = self.shared.queue.lock();
        queue.shutdown = true;
        queue.heap.clear();
        self.shared.wakeup.notify_all();
    }

    fn insert(
        &self,
        pool: Weak<PoolInner>,
        description: &'static str,
        due: Instant,
        cancelled: Arc<AtomicBool>,
        task: TimerTask,
    ) {
        let start_thread = {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                trace!(task = description, "Timer shut down; dropping scheduled task");
                return;
            }
            let seq = queue.next_seq;
            queue.next_seq += 1;
            queue.heap.push(Reverse(TimerEntry {
                due,
                seq,
                description,
                cancelled,
                task,
            }));
            let start = !queue.thread_started;
            queue.thread_started = true;
            start
        };
        if start_thread {
            let shared = Arc::clone(&self.shared);
            let spawned = std::thread::Builder::new()
                .name("pool-timer".into())
                .spawn(move || timer_loop(shared, pool));
            if let Err(e) = spawned {
                error!(error = %e, "Failed to start timer thread");
                self.shared.queue.lock().thread_started = false;
            }
        } else {
            self.shared.wakeup.notify_one();
        }
    }
}

fn timer_loop(shared: Arc<TimerShared>, pool: Weak<PoolInner>) {
    loop {
        let due_entries = {
            let mut queue = shared.queue.lock();
            loop {
                if queue.shutdown || pool.strong_count() == 0 {
                    queue.thread_started = false;
                    return;
                }
                let now = Instant::now();
                let wait = match queue.heap.peek() {
                    Some(Reverse(entry)) if entry.due <= now => break,
                    Some(Reverse(entry)) => (entry.due - now).min(MAX_TIMER_PARK),
                    None => MAX_TIMER_PARK,
                };
                shared.wakeup.wait_for(&mut queue, wait);
            }
            let now = Instant::now();
            let mut due = Vec::new();
            while queue.heap.peek().map_or(false, |Reverse(entry)| entry.due <= now) {
                if let Some(Reverse(entry)) = queue.heap.pop() {
                    due.push(entry);
                }
            }
            due
        };

        let Some(inner) = pool.upgrade() else {
            return;
        };
        let mut reschedule = Vec::new();
        for entry in due_entries {
            if entry.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            match entry.task {
                TimerTask::Once(job) => dispatch_timer_job(&inner, entry.description, job),
                TimerTask::Periodic { task, period } => {
                    let run = Arc::clone(&task);
                    dispatch_timer_job(&inner, entry.description, Box::new(move || run()));
                    reschedule.push(TimerEntry {
                        due: entry.due + period,
                        task: TimerTask::Periodic { task, period },
                        ..entry
                    });
                }
            }
        }
        drop(inner);

        if !reschedule.is_empty() {
            let mut queue = shared.queue.lock();
            if !queue.shutdown {
                for entry in reschedule {
                    queue.heap.push(Reverse(entry));
                }
            }
        }
    }
}

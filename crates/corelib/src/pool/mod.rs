//! Shared worker pool.
//!
//! Every component submits its short-lived work (request dispatch, callback
//! delivery, health probes, timeouts) to one elastic pool instead of spawning
//! ad hoc threads. The only long-lived dedicated threads are the queue
//! consumers in the transport crate.
//!
//! # Components
//!
//! - [`WorkerPool`]: elastic thread pool (core..max threads, idle threads
//!   above the core size retire) with named task classes
//! - [`TaskStatistics`]: per-task-class counters (active, completed, max
//!   parallel, average/max duration, panics)
//! - timer: delayed and periodic tasks, dispatched onto the pool when due
//! - [`TaskHandle`]: waitable result of [`WorkerPool::submit`]

pub mod handle;
pub mod stats;
pub mod timer;
pub mod worker_pool;

pub use handle::{ScheduledHandle, TaskHandle};
pub use stats::{TaskStatistics, TaskStatsSnapshot};
pub use worker_pool::{PoolConfig, WorkerPool};

/// Unit of work executed by the pool.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

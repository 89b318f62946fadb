//! Handles returned by the pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};

use crate::error::{Error, Result};

/// Waitable result of a task submitted with [`super::WorkerPool::submit`].
pub struct TaskHandle<T> {
    pub(crate) receiver: Receiver<std::thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task has finished.
    pub fn wait(&self) -> Result<T> {
        match self.receiver.recv() {
            Ok(result) => Self::unwrap_outcome(result),
            Err(_) => Err(Error::Consistency("task was dropped before it ran".into())),
        }
    }

    /// Block until the task has finished or the timeout expired.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Self::unwrap_outcome(result),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!("task did not finish within {:?}", timeout))),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Consistency("task was dropped before it ran".into())),
        }
    }

    fn unwrap_outcome(result: std::thread::Result<T>) -> Result<T> {
        result.map_err(|_| Error::Consistency("task panicked".into()))
    }
}

/// Cancellation handle for delayed and periodic tasks.
#[derive(Clone, Debug, Default)]
pub struct ScheduledHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Prevent any further execution. A run that already started completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

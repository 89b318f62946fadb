//! Process-wide communication context.
//!
//! One `CommContext` is constructed per process (or per simulated node in
//! tests) and handed to every component constructor. It owns the shared
//! [`WorkerPool`] and the configuration, replacing global singletons.

use std::sync::Arc;

use crate::config::CommConfig;
use crate::error::Result;
use crate::pool::{PoolConfig, WorkerPool};

struct ContextInner {
    config: CommConfig,
    pool: WorkerPool,
}

/// Shared configuration and worker pool. Cheap to clone.
#[derive(Clone)]
pub struct CommContext {
    inner: Arc<ContextInner>,
}

impl CommContext {
    /// Validate `config` and start a worker pool sized by it.
    pub fn new(config: CommConfig) -> Result<Self> {
        Self::with_pool_name(config, "comm-worker")
    }

    /// Like [`CommContext::new`], with a custom thread name prefix.
    pub fn with_pool_name(config: CommConfig, pool_name: &str) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(PoolConfig::from_comm_config(pool_name, &config));
        Ok(Self {
            inner: Arc::new(ContextInner { config, pool }),
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Shut down the worker pool; queued tasks still complete.
    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

//! Communication layer configuration.
//!
//! All tuning constants (timeouts, retry counts, jitter bounds, pool sizes)
//! live here instead of being hardcoded in the components. Values can be
//! loaded from JSON; missing fields fall back to [`CommConfig::default`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version spoken by this build.
pub const DEFAULT_PROTOCOL_VERSION: &str = "3.1";

/// Configuration shared by every component of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Protocol version announced during handshakes.
    pub protocol_version: String,
    /// Whether this node forwards requests addressed to other nodes.
    pub is_relay: bool,
    /// Default timeout for ordinary requests.
    pub request_timeout_ms: u64,
    /// Maximum time to wait for a handshake response.
    pub handshake_timeout_ms: u64,
    /// Interval between two health check rounds.
    pub health_check_interval_ms: u64,
    /// Timeout of a single health probe.
    pub health_check_timeout_ms: u64,
    /// Upper bound of the random delay before each probe.
    pub health_check_max_jitter_ms: u64,
    /// Consecutive probe failures after which a channel is considered broken.
    pub health_check_failure_limit: u32,
    /// How often a response without a registered listener is looked up again.
    pub response_retry_count: u32,
    /// Delay between two response lookups.
    pub response_retry_interval_ms: u64,
    /// Threads kept alive even when idle.
    pub worker_pool_core_threads: usize,
    /// Hard upper bound for pool threads.
    pub worker_pool_max_threads: usize,
    /// Idle time after which non-core threads retire.
    pub worker_idle_timeout_ms: u64,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            is_relay: false,
            request_timeout_ms: 40_000,
            handshake_timeout_ms: 10_000,
            health_check_interval_ms: 20_000,
            health_check_timeout_ms: 5_000,
            health_check_max_jitter_ms: 5_000,
            health_check_failure_limit: 3,
            response_retry_count: 20,
            response_retry_interval_ms: 500,
            worker_pool_core_threads: 4,
            worker_pool_max_threads: 256,
            worker_idle_timeout_ms: 60_000,
            log_filter: "info".to_string(),
        }
    }
}

impl CommConfig {
    /// Parse a configuration from JSON and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CommConfig = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid configuration JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_version.trim().is_empty() {
            return Err(Error::Config("protocol_version must not be empty".into()));
        }
        if self.request_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        if self.health_check_timeout_ms == 0 || self.health_check_interval_ms == 0 {
            return Err(Error::Config("health check interval and timeout must be positive".into()));
        }
        if self.health_check_failure_limit == 0 {
            return Err(Error::Config("health_check_failure_limit must be at least 1".into()));
        }
        if self.worker_pool_max_threads == 0
            || self.worker_pool_core_threads > self.worker_pool_max_threads
        {
            return Err(Error::Config(format!(
                "invalid worker pool bounds: core={} max={}",
                self.worker_pool_core_threads, self.worker_pool_max_threads
            )));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn health_check_max_jitter(&self) -> Duration {
        Duration::from_millis(self.health_check_max_jitter_ms)
    }

    pub fn response_retry_interval(&self) -> Duration {
        Duration::from_millis(self.response_retry_interval_ms)
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }
}

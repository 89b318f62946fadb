//! Channel health monitoring.
//!
//! Every registered channel is probed periodically: a `healthCheck` request
//! carrying a random token must come back with exactly that token. Any
//! failure (error response, timeout, undecodable or mismatching content)
//! increments the channel's consecutive-failure counter; a success resets
//! it. When the counter reaches the configured limit the channel is broken.
//!
//! Probes of one channel never overlap. The probe flag and the counter are
//! only touched under a short-held lock; the probe itself runs outside it.

use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use corelib::message::{deserialize_payload, serialize_payload, NetworkRequest, MESSAGE_TYPE_HEALTH_CHECK};
use corelib::NodeId;
use transport::{ChannelDirection, ChannelState, MessageChannel};

/// Result of one health check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthCheckOutcome {
    /// Probe succeeded; the failure counter is zero.
    Healthy,
    /// Probe failed; the limit has not been reached yet.
    Failed { consecutive_failures: u32 },
    /// Probe failed and the limit was reached; the channel is being broken.
    Broken,
    /// Channel not established or a probe already running.
    Skipped,
}

#[derive(Debug, Default)]
struct HealthInner {
    consecutive_failures: u32,
    probe_in_progress: bool,
}

/// Per-channel failure counter and probe lock.
#[derive(Debug)]
pub struct ChannelHealthState {
    failure_limit: u32,
    inner: Mutex<HealthInner>,
}

impl ChannelHealthState {
    pub fn new(failure_limit: u32) -> Self {
        Self {
            failure_limit,
            inner: Mutex::new(HealthInner::default()),
        }
    }

    /// Claim the probe slot; `None` if a probe is already running.
    pub fn try_begin_probe(&self) -> Option<ProbeGuard<'_>> {
        let mut inner = self.inner.lock();
        if inner.probe_in_progress {
            return None;
        }
        inner.probe_in_progress = true;
        Some(ProbeGuard { state: self })
    }

    /// Record a probe result. Returns `true` once the consecutive failures
    /// reach the limit.
    pub fn record_result(&self, success: bool) -> bool {
        let mut inner = self.inner.lock();
        if success {
            inner.consecutive_failures = 0;
            false
        } else {
            inner.consecutive_failures += 1;
            inner.consecutive_failures >= self.failure_limit
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    pub fn failure_limit(&self) -> u32 {
        self.failure_limit
    }
}

/// Releases the probe slot on drop.
pub struct ProbeGuard<'a> {
    state: &'a ChannelHealthState,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.state.inner.lock().probe_in_progress = false;
    }
}

/// Diagnostic view of one registered channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelHealthSnapshot {
    pub channel_id: String,
    pub remote_node: String,
    pub direction: ChannelDirection,
    pub state: ChannelState,
    pub consecutive_failures: u32,
}

/// Send one probe over `channel` and check the echoed token.
pub(crate) fn probe_channel(channel: &MessageChannel, local_node: NodeId, timeout: Duration) -> bool {
    let token: u64 = rand::random();
    let content = match serialize_payload(&token) {
        Ok(content) => content,
        Err(e) => {
            debug!(error = %e, "Cannot encode health check token");
            return false;
        }
    };
    let request = NetworkRequest::new(MESSAGE_TYPE_HEALTH_CHECK, content, local_node, None);
    let response = channel.send_request_sync(request, timeout);
    if !response.is_success() {
        debug!(
            channel_id = %channel.id(),
            result = %response.result_code(),
            "Health check failed"
        );
        return false;
    }
    match deserialize_payload::<u64>(response.content()) {
        Ok(echoed) if echoed == token => {
            trace!(channel_id = %channel.id(), "Health check passed");
            true
        }
        Ok(_) => {
            debug!(channel_id = %channel.id(), "Health check returned a different token");
            false
        }
        Err(e) => {
            debug!(channel_id = %channel.id(), error = %e, "Health check response is not a token");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_resets_counter() {
        let state = ChannelHealthState::new(3);
        assert!(!state.record_result(false));
        assert!(!state.record_result(false));
        assert_eq!(state.consecutive_failures(), 2);
        assert!(!state.record_result(true));
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_limit_reached() {
        let state = ChannelHealthState::new(3);
        assert!(!state.record_result(false));
        assert!(!state.record_result(false));
        assert!(state.record_result(false));
    }

    #[test]
    fn test_probes_do_not_overlap() {
        let state = ChannelHealthState::new(3);
        let guard = state.try_begin_probe();
        assert!(guard.is_some());
        assert!(state.try_begin_probe().is_none());
        drop(guard);
        assert!(state.try_begin_probe().is_some());
    }
}

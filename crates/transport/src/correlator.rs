//! Response correlation.
//!
//! Maps the broker message id of every outstanding request to its response
//! callback. Exactly one of three events completes a pending request: the
//! response arrives, its timeout fires, or the correlator is closed. The map
//! removal decides which one wins; the losers find nothing and do nothing.
//!
//! The correlation id is only known once the request has been sent, so a
//! fast response may arrive before the callback is registered. Unmatched
//! responses are therefore looked up again a bounded number of times before
//! they are discarded; the request's own timeout remains the fallback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::RecvTimeoutError;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use corelib::message::{factory, NetworkRequest, NetworkResponse};
use corelib::pool::ScheduledHandle;
use corelib::{CommContext, NodeId};

/// Callback receiving the outcome of a request.
pub type ResponseCallback = Box<dyn FnOnce(NetworkResponse) + Send + 'static>;

struct PendingRequest {
    request: NetworkRequest,
    // The callback itself need not be `Sync`; the table must be.
    callback: Mutex<ResponseCallback>,
    timeout: Option<ScheduledHandle>,
}

struct CorrelatorInner {
    context: CommContext,
    local_node: NodeId,
    channel_id: String,
    pending: DashMap<String, PendingRequest>,
    closed: AtomicBool,
}

impl CorrelatorInner {
    fn deliver(&self, callback: ResponseCallback, response: NetworkResponse) {
        if !self.context.pool().execute("response delivery", move || callback(response)) {
            warn!(channel_id = %self.channel_id, "Worker pool unavailable; response callback dropped");
        }
    }

    fn take(&self, correlation_id: &str) -> Option<PendingRequest> {
        let (_, pending) = self.pending.remove(correlation_id)?;
        if let Some(timeout) = &pending.timeout {
            timeout.cancel();
        }
        Some(pending)
    }

    fn on_timeout(&self, correlation_id: &str) {
        if let Some(pending) = self.take(correlation_id) {
            debug!(channel_id = %self.channel_id, correlation_id, "Request timed out");
            let response = factory::timeout_waiting_for_response(&pending.request, self.local_node);
            self.deliver(pending.callback.into_inner(), response);
        }
    }

    fn try_complete(&self, correlation_id: &str, response: NetworkResponse) -> Option<NetworkResponse> {
        match self.take(correlation_id) {
            Some(pending) => {
                self.deliver(pending.callback.into_inner(), response);
                None
            }
            None => Some(response),
        }
    }
}

/// Pending-request table of one channel.
#[derive(Clone)]
pub struct ResponseCorrelator {
    inner: Arc<CorrelatorInner>,
}

impl ResponseCorrelator {
    pub fn new(context: CommContext, local_node: NodeId, channel_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                context,
                local_node,
                channel_id: channel_id.into(),
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register the callback for the request sent with broker message id
    /// `correlation_id`. After `timeout` the callback receives a timeout
    /// response unless something else completed the request first.
    pub fn register(&self, correlation_id: String, request: NetworkRequest, callback: ResponseCallback, timeout: Duration) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            let response = factory::channel_closed_while_waiting(&request, inner.local_node);
            inner.deliver(callback, response);
            return;
        }
        // The entry must exist before its timeout can fire.
        inner.pending.insert(
            correlation_id.clone(),
            PendingRequest {
                request,
                callback: Mutex::new(callback),
                timeout: None,
            },
        );
        let weak = Arc::downgrade(inner);
        let timeout_id = correlation_id.clone();
        let handle = inner.context.pool().schedule_after("request timeout", timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(&timeout_id);
            }
        });
        match inner.pending.get_mut(&correlation_id) {
            Some(mut pending) => pending.timeout = Some(handle),
            None => handle.cancel(),
        }
        // close_all_pending may have swept the table between the check and the insert
        if inner.closed.load(Ordering::SeqCst) {
            if let Some(pending) = inner.take(&correlation_id) {
                let response = factory::channel_closed_while_waiting(&pending.request, inner.local_node);
                inner.deliver(pending.callback.into_inner(), response);
            }
        }
    }

    /// Complete the request matching `correlation_id` with `response`,
    /// retrying the lookup if the callback is not registered yet.
    pub fn on_response(&self, correlation_id: String, response: NetworkResponse) {
        let Some(response) = self.inner.try_complete(&correlation_id, response) else {
            return;
        };
        let config = self.inner.context.config();
        let retries = config.response_retry_count;
        if retries == 0 {
            warn!(channel_id = %self.inner.channel_id, correlation_id = %correlation_id, "No listener for response; discarding it");
            return;
        }
        trace!(channel_id = %self.inner.channel_id, correlation_id = %correlation_id, "No listener yet; retrying lookup");
        schedule_retry(
            Arc::clone(&self.inner),
            correlation_id,
            response,
            1,
            retries,
            config.response_retry_interval(),
        );
    }

    /// Fail every pending request with a "channel closed" response. Requests
    /// registered afterwards fail immediately.
    pub fn close_all_pending(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        let ids: Vec<String> = inner.pending.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for id in ids {
            if let Some(pending) = inner.take(&id) {
                let response = factory::channel_closed_while_waiting(&pending.request, inner.local_node);
                inner.deliver(pending.callback.into_inner(), response);
                closed += 1;
            }
        }
        if closed > 0 {
            debug!(channel_id = %inner.channel_id, closed, "Failed pending requests on close");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Extra wait beyond a request's own timeout before a blocking caller gives
/// up on the callback.
const SYNC_WAIT_MARGIN: Duration = Duration::from_secs(1);

/// Block until the callback handed to `send` receives its response.
///
/// `send` must arrange for the callback to be invoked once. If it never is,
/// the caller gets a timeout response after `timeout` plus a margin.
pub fn await_response<F>(request: NetworkRequest, local_node: NodeId, timeout: Duration, send: F) -> NetworkResponse
where
    F: FnOnce(NetworkRequest, ResponseCallback),
{
    let (tx, rx) = crossbeam::channel::bounded(1);
    let fallback = request.clone();
    send(
        request,
        Box::new(move |response| {
            let _ = tx.send(response);
        }),
    );
    match rx.recv_timeout(timeout + SYNC_WAIT_MARGIN) {
        Ok(response) => response,
        Err(RecvTimeoutError::Timeout) => factory::timeout_waiting_for_response(&fallback, local_node),
        Err(RecvTimeoutError::Disconnected) => factory::channel_closed_while_waiting(&fallback, local_node),
    }
}

fn schedule_retry(
    inner: Arc<CorrelatorInner>,
    correlation_id: String,
    response: NetworkResponse,
    attempt: u32,
    max_attempts: u32,
    interval: Duration,
) {
    let pool = inner.context.pool().clone();
    pool.schedule_after("response lookup retry", interval, move || {
        let Some(response) = inner.try_complete(&correlation_id, response) else {
            trace!(channel_id = %inner.channel_id, correlation_id = %correlation_id, attempt, "Listener found on retry");
            return;
        };
        if attempt >= max_attempts {
            warn!(
                channel_id = %inner.channel_id,
                correlation_id = %correlation_id,
                attempts = attempt,
                "No listener for response after retries; discarding it"
            );
            return;
        }
        schedule_retry(inner, correlation_id, response, attempt + 1, max_attempts, interval);
    });
}

//! Request correlation table.
//!
//! [`RequestTracker`] converts the fire-and-forget pub/sub protocol into
//! a request/reply calling convention: the caller registers a pending
//! request *before* publishing it (avoiding the lost-response race),
//! then awaits the returned [`PendingRequest`], which completes with the
//! response payload or a timeout error.
//!
//! Every slot resolves exactly once. Late responses for an id that has
//! already resolved, rejected, or timed out are logged and discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

/// Errors delivered to a waiting caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    /// The target agent never responded before the deadline.
    ///
    /// The display form is surfaced verbatim to the LLM as a tool-result
    /// error, so it names the agent and the elapsed budget.
    #[error("Agent {agent} did not respond within {timeout_ms} ms")]
    Timeout {
        /// Target agent name.
        agent: String,
        /// The deadline that expired, in milliseconds.
        timeout_ms: u64,
    },

    /// The request was explicitly rejected.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The tracker was dropped before the slot resolved.
    #[error("request slot dropped before completion")]
    Dropped,
}

struct PendingEntry {
    target_agent: String,
    deadline: Instant,
    timeout_ms: u64,
    slot: oneshot::Sender<Result<serde_json::Value, RequestError>>,
}

/// A handle to one outstanding request.
pub struct PendingRequest {
    rx: oneshot::Receiver<Result<serde_json::Value, RequestError>>,
}

impl PendingRequest {
    /// Wait for the response payload or the deadline.
    pub async fn wait(self) -> Result<serde_json::Value, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Dropped),
        }
    }
}

/// Process-local map from request id to a one-shot result slot.
///
/// Cloning is cheap; all clones share the same table.
#[derive(Clone, Default)]
pub struct RequestTracker {
    pending: Arc<DashMap<Uuid, PendingEntry>>,
}

impl RequestTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `id` and arm its deadline timer.
    ///
    /// Must be called before the request envelope is published, so a
    /// fast responder cannot race the registration.
    pub fn track(&self, id: Uuid, target_agent: &str, timeout: Duration) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let timeout_ms = timeout.as_millis() as u64;
        self.pending.insert(
            id,
            PendingEntry {
                target_agent: target_agent.to_string(),
                deadline: Instant::now() + timeout,
                timeout_ms,
                slot: tx,
            },
        );
        debug!(%id, agent = target_agent, timeout_ms, "tracking request");

        let pending = Arc::clone(&self.pending);
        let agent = target_agent.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = pending.remove(&id) {
                warn!(%id, agent = %agent, timeout_ms, "request timed out");
                let _ = entry.slot.send(Err(RequestError::Timeout { agent, timeout_ms }));
            }
        });

        PendingRequest { rx }
    }

    /// Resolve the slot for `id` with a response payload.
    ///
    /// Returns `false` when no slot exists (late or unsolicited
    /// response); the payload is then discarded.
    pub fn deliver(&self, id: Uuid, payload: serde_json::Value) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                debug!(%id, agent = %entry.target_agent, "delivering response");
                let _ = entry.slot.send(Ok(payload));
                true
            }
            None => {
                warn!(%id, "late response discarded, no pending request");
                false
            }
        }
    }

    /// Reject the slot for `id`, if present.
    pub fn reject(&self, id: Uuid, reason: impl Into<String>) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let reason = reason.into();
                warn!(%id, agent = %entry.target_agent, %reason, "rejecting request");
                let _ = entry.slot.send(Err(RequestError::Rejected(reason)));
                true
            }
            None => false,
        }
    }

    /// Clear entries that outlived their deadline without being
    /// rejected by their timer, delivering the timeout error.
    ///
    /// The per-entry timers normally fire first; the sweep is a backstop
    /// invoked periodically alongside conversation eviction.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, entry)) = self.pending.remove(&id) {
                warn!(%id, agent = %entry.target_agent, "sweeping expired request");
                let _ = entry.slot.send(Err(RequestError::Timeout {
                    agent: entry.target_agent,
                    timeout_ms: entry.timeout_ms,
                }));
                removed += 1;
            }
        }
        removed
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

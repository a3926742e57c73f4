//! Heartbeat-backed agent status registry.
//!
//! Aggregates `agent:status` envelopes into a map keyed by the sending
//! agent. An entry older than two heartbeat intervals counts as stale:
//! the agent may still exist, but it has missed enough heartbeats to be
//! reported as unresponsive.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use troupe_types::envelope::Envelope;

/// Worker heartbeat cadence the registry expects.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Entries older than this (two missed heartbeats, plus slack) are
/// reported stale.
pub const STALE_AFTER: Duration = Duration::from_secs(130);

#[derive(Debug, Clone)]
struct StatusEntry {
    payload: Value,
    last_seen: Instant,
}

/// Last observed status per agent.
#[derive(Default)]
pub struct StatusRegistry {
    entries: DashMap<String, StatusEntry>,
}

impl StatusRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a status envelope.
    pub fn observe(&self, envelope: &Envelope) {
        debug!(agent = %envelope.from, "status heartbeat observed");
        self.entries.insert(
            envelope.from.clone(),
            StatusEntry {
                payload: envelope.payload.clone(),
                last_seen: Instant::now(),
            },
        );
    }

    /// The last payload for `agent` with its age, if any was ever seen.
    pub fn last_seen(&self, agent: &str) -> Option<(Value, Duration)> {
        self.entries
            .get(agent)
            .map(|entry| (entry.payload.clone(), entry.last_seen.elapsed()))
    }

    /// Human-readable status line for the `check-agent-status` tool.
    pub fn describe(&self, agent: &str) -> String {
        match self.last_seen(agent) {
            None => format!(
                "Agent {agent}: no heartbeat observed since startup. \
                 It is either offline or was never started."
            ),
            Some((payload, age)) if age > STALE_AFTER => format!(
                "Agent {agent}: UNRESPONSIVE. Last heartbeat {}s ago reported {}.",
                age.as_secs(),
                summarize(&payload)
            ),
            Some((payload, age)) => format!(
                "Agent {agent}: {} (heartbeat {}s ago).",
                summarize(&payload),
                age.as_secs()
            ),
        }
    }
}

fn summarize(payload: &Value) -> String {
    let status = payload
        .get("status")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    let mut summary = status.to_string();
    if let Some(task) = payload.get("current_task_id").and_then(|v| v.as_str()) {
        summary.push_str(&format!(", task {task}"));
    }
    if let Some(done) = payload.get("completed_count").and_then(|v| v.as_u64()) {
        summary.push_str(&format!(", {done} completed"));
    }
    if let Some(uptime) = payload.get("uptime_seconds").and_then(|v| v.as_u64()) {
        summary.push_str(&format!(", up {uptime}s"));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use troupe_types::envelope::MessageType;

    fn heartbeat(from: &str, payload: Value) -> Envelope {
        Envelope::new(from, "*", MessageType::Status, payload)
    }

    #[test]
    fn unknown_agent_reported_as_never_seen() {
        let registry = StatusRegistry::new();
        let text = registry.describe("frontend");
        assert!(text.contains("no heartbeat observed"));
    }

    #[test]
    fn observed_agent_is_described() {
        let registry = StatusRegistry::new();
        registry.observe(&heartbeat(
            "frontend",
            json!({"status": "idle", "completed_count": 4, "uptime_seconds": 300}),
        ));

        let text = registry.describe("frontend");
        assert!(text.contains("idle"));
        assert!(text.contains("4 completed"));
        assert!(text.contains("up 300s"));
        assert!(!text.contains("UNRESPONSIVE"));
    }

    #[test]
    fn newer_heartbeat_replaces_older() {
        let registry = StatusRegistry::new();
        registry.observe(&heartbeat("backend", json!({"status": "idle"})));
        registry.observe(&heartbeat("backend", json!({"status": "working"})));

        let (payload, _) = registry.last_seen("backend").unwrap();
        assert_eq!(payload["status"], "working");
    }

    #[test]
    fn agents_are_keyed_independently() {
        let registry = StatusRegistry::new();
        registry.observe(&heartbeat("frontend", json!({"status": "idle"})));
        registry.observe(&heartbeat("backend", json!({"status": "working"})));

        assert!(registry.describe("frontend").contains("idle"));
        assert!(registry.describe("backend").contains("working"));
    }

    #[test]
    fn working_payload_includes_task() {
        let registry = StatusRegistry::new();
        registry.observe(&heartbeat(
            "backend",
            json!({"status": "working", "current_task_id": "abc-123"}),
        ));
        assert!(registry.describe("backend").contains("task abc-123"));
    }
}

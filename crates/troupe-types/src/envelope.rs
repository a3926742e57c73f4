//! The envelope wire format.
//!
//! [`Envelope`] is the sole unit of communication on the bus. Every
//! message any agent publishes -- tasks, questions, responses, status
//! heartbeats, progress chunks, errors -- is an envelope serialized as
//! a self-describing JSON string.
//!
//! # Correlation
//!
//! Request/response pairing is carried in the envelope itself: a
//! `response`-typed envelope must set [`in_response_to`](Envelope::in_response_to)
//! to the `id` of the originating request, and no other type may set it.
//! [`Envelope::validate`] enforces this on both ends of the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known bus channel names.
pub mod channels {
    /// Human input from the gateway to the orchestrator.
    pub const HUMAN_INPUT: &str = "human-input";

    /// Orchestrator replies bound for human clients.
    pub const CHATTER_OUTPUT: &str = "chatter-output";

    /// Periodic worker state heartbeats.
    pub const AGENT_STATUS: &str = "agent:status";

    /// Streamed subprocess output from workers.
    pub const AGENT_PROGRESS: &str = "agent:progress";

    /// System-wide messages (e.g. shutdown commands).
    pub const BROADCAST: &str = "broadcast";

    /// The request/response channel owned by a named agent.
    ///
    /// Requests *to* an agent and responses *from* it travel on the same
    /// channel; consumers tell them apart by envelope type and correlate
    /// by `in_response_to`.
    pub fn agent_channel(name: &str) -> String {
        format!("agent:{name}")
    }
}

/// The type of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// A job hand-off carrying a command payload.
    Task,
    /// A request expecting a correlated response.
    Question,
    /// The terminal reply to a task or question.
    Response,
    /// A periodic state announcement.
    Status,
    /// A non-terminal output chunk for a running task.
    Progress,
    /// An error report.
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageType::Task => "task",
            MessageType::Question => "question",
            MessageType::Response => "response",
            MessageType::Status => "status",
            MessageType::Progress => "progress",
            MessageType::Error => "error",
        };
        f.write_str(s)
    }
}

/// Errors from envelope construction and parsing.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// The payload was not valid JSON.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A `response` envelope without `in_response_to`.
    #[error("response envelope {id} missing in_response_to")]
    MissingCorrelation {
        /// Envelope id.
        id: Uuid,
    },

    /// A non-`response` envelope carrying `in_response_to`.
    #[error("{kind} envelope {id} must not set in_response_to")]
    UnexpectedCorrelation {
        /// Envelope id.
        id: Uuid,
        /// The offending envelope type.
        kind: MessageType,
    },
}

/// A message exchanged between agents on the bus.
///
/// Envelopes are created with [`Envelope::new`] for outbound requests,
/// statuses and progress, or [`Envelope::response_to`] for correlated
/// replies. Use [`to_wire`](Envelope::to_wire) / [`from_wire`](Envelope::from_wire)
/// at the transport boundary; both uphold the correlation invariant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identifier, generated by the sender.
    pub id: Uuid,

    /// Sender agent name.
    pub from: String,

    /// Target agent name, or `"*"` for broadcasts.
    pub to: String,

    /// Message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Type-specific payload.
    pub payload: serde_json::Value,

    /// When the envelope was created.
    pub timestamp: DateTime<Utc>,

    /// For `response` envelopes, the id of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_response_to: Option<Uuid>,
}

impl Envelope {
    /// Create a new non-response envelope.
    ///
    /// Responses are built with [`Envelope::response_to`], which is the
    /// only constructor that sets `in_response_to`.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
            timestamp: Utc::now(),
            in_response_to: None,
        }
    }

    /// Create a response correlated to `request`, addressed back to its
    /// sender.
    pub fn response_to(
        request: &Envelope,
        from: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: request.from.clone(),
            kind: MessageType::Response,
            payload,
            timestamp: Utc::now(),
            in_response_to: Some(request.id),
        }
    }

    /// Check the correlation invariant: `in_response_to` is set iff the
    /// envelope is a `response`.
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        match (self.kind, self.in_response_to) {
            (MessageType::Response, None) => {
                Err(EnvelopeError::MissingCorrelation { id: self.id })
            }
            (MessageType::Response, Some(_)) => Ok(()),
            (kind, Some(_)) => Err(EnvelopeError::UnexpectedCorrelation { id: self.id, kind }),
            (_, None) => Ok(()),
        }
    }

    /// Serialize for the wire.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse an envelope off the wire, enforcing the correlation invariant.
    pub fn from_wire(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Whether this envelope is a broadcast (`to = "*"`).
    pub fn is_broadcast(&self) -> bool {
        self.to == "*"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_envelope_has_no_correlation() {
        let env = Envelope::new("gateway", "chatter", MessageType::Question, json!({"q": 1}));
        assert_eq!(env.from, "gateway");
        assert_eq!(env.to, "chatter");
        assert!(env.in_response_to.is_none());
        env.validate().unwrap();
    }

    #[test]
    fn response_to_correlates_and_reverses_direction() {
        let req = Envelope::new("chatter", "researcher", MessageType::Question, json!({}));
        let resp = Envelope::response_to(&req, "researcher", json!({"answer": 42}));
        assert_eq!(resp.kind, MessageType::Response);
        assert_eq!(resp.to, "chatter");
        assert_eq!(resp.from, "researcher");
        assert_eq!(resp.in_response_to, Some(req.id));
        resp.validate().unwrap();
    }

    #[test]
    fn wire_roundtrip_preserves_all_fields() {
        let env = Envelope::new("frontend", "chatter", MessageType::Progress, json!({"output": "ok"}));
        let wire = env.to_wire().unwrap();
        let restored = Envelope::from_wire(&wire).unwrap();
        assert_eq!(restored.id, env.id);
        assert_eq!(restored.from, env.from);
        assert_eq!(restored.to, env.to);
        assert_eq!(restored.kind, env.kind);
        assert_eq!(restored.payload, env.payload);
        assert_eq!(restored.timestamp, env.timestamp);
        assert_eq!(restored.in_response_to, None);
    }

    #[test]
    fn type_serializes_lowercase() {
        let env = Envelope::new("a", "b", MessageType::Status, json!({}));
        let wire = env.to_wire().unwrap();
        let value: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "status");
    }

    #[test]
    fn non_response_omits_in_response_to_on_wire() {
        let env = Envelope::new("a", "b", MessageType::Task, json!({}));
        let wire = env.to_wire().unwrap();
        assert!(!wire.contains("in_response_to"));
    }

    #[test]
    fn from_wire_rejects_response_without_correlation() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "from": "a",
            "to": "b",
            "type": "response",
            "payload": {},
            "timestamp": Utc::now(),
        })
        .to_string();
        let err = Envelope::from_wire(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::MissingCorrelation { .. }));
    }

    #[test]
    fn from_wire_rejects_correlated_non_response() {
        let raw = json!({
            "id": Uuid::new_v4(),
            "from": "a",
            "to": "b",
            "type": "status",
            "payload": {},
            "timestamp": Utc::now(),
            "in_response_to": Uuid::new_v4(),
        })
        .to_string();
        let err = Envelope::from_wire(&raw).unwrap_err();
        assert!(matches!(err, EnvelopeError::UnexpectedCorrelation { .. }));
    }

    #[test]
    fn from_wire_rejects_garbage() {
        assert!(matches!(
            Envelope::from_wire("not json").unwrap_err(),
            EnvelopeError::Malformed(_)
        ));
    }

    #[test]
    fn agent_channel_name() {
        assert_eq!(channels::agent_channel("researcher"), "agent:researcher");
    }

    #[test]
    fn broadcast_detection() {
        let env = Envelope::new("system", "*", MessageType::Status, json!({"command": "shutdown"}));
        assert!(env.is_broadcast());
    }
}

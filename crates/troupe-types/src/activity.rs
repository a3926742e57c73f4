//! Rows for the append-only activity log.
//!
//! Two tables: `agent_messages` mirrors envelopes crossing the bus,
//! `logs` records service-level diagnostics. Writes are best-effort
//! everywhere; a failed insert never blocks the bus path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{Envelope, MessageType};

/// A row in the `agent_messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Sender agent name.
    pub from_agent: String,

    /// Target agent name, or `"*"`.
    pub to_agent: String,

    /// Envelope type, constrained by the table schema.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// The envelope payload.
    pub payload: serde_json::Value,

    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// Build a record mirroring an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            from_agent: envelope.from.clone(),
            to_agent: envelope.to.clone(),
            kind: envelope.kind,
            payload: envelope.payload.clone(),
            created_at: envelope.timestamp,
        }
    }
}

/// Log severity, constrained by the `logs` table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// A row in the `logs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// The agent that produced the entry.
    pub agent: String,

    /// Severity.
    pub level: LogLevel,

    /// Log message.
    pub message: String,

    /// Structured context.
    #[serde(default)]
    pub metadata: serde_json::Value,

    /// Insert timestamp.
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    /// Build a log row stamped now.
    pub fn new(
        agent: impl Into<String>,
        level: LogLevel,
        message: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            agent: agent.into(),
            level,
            message: message.into(),
            metadata,
            created_at: Utc::now(),
        }
    }
}

//! Wire frames exchanged with browser clients.
//!
//! System frames are tagged by `type`; bus forwards are wrapped as
//! `{channel, data, timestamp}` so the dashboard can route them without
//! understanding every payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use troupe_types::envelope::Envelope;

/// A gateway-originated frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SystemFrame {
    /// First frame on every connection.
    Welcome {
        /// The identity minted for this socket.
        client_id: Uuid,
    },

    /// A client message was accepted and published.
    Ack,

    /// A client message failed validation or publishing.
    Error {
        /// Human-readable reason.
        message: String,
    },

    /// Keep-alive, sent every 30 seconds.
    Heartbeat,
}

impl SystemFrame {
    /// Serialize for the socket.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error"}"#.to_string())
    }
}

/// A bus envelope forwarded to every connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardFrame {
    /// The bus channel the envelope appeared on.
    pub channel: String,

    /// The envelope itself.
    pub data: Envelope,

    /// When the gateway forwarded it.
    pub timestamp: DateTime<Utc>,
}

/// A message sent by a browser client.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    /// Message text; required and non-empty.
    pub content: String,

    /// Stable user identity; falls back to the socket's client id.
    #[serde(default)]
    pub user_id: Option<String>,
}

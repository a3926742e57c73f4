//! Per-user conversation histories.
//!
//! Histories are in-memory only, bounded, and evicted when idle. Turns
//! are stored in the provider's message shape (`{role, content}`) so
//! the turn loop can hand them to the model without translation;
//! content may be a plain string or an array of content blocks.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// One user's bounded history.
#[derive(Debug, Clone)]
struct Conversation {
    turns: Vec<Value>,
    last_activity_at: DateTime<Utc>,
}

/// Map from user id to bounded conversation, safe for concurrent use.
///
/// The turn loop appends; the periodic sweep evicts idle entries. Both
/// serialize on the same lock.
pub struct ConversationStore {
    inner: Mutex<HashMap<String, Conversation>>,
    limit: usize,
}

impl ConversationStore {
    /// Store that keeps at most `limit` turns per user.
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            limit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Conversation>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a turn, trimming the oldest entries past the cap and
    /// bumping the activity timestamp.
    pub fn append(&self, user_id: &str, turn: Value) {
        let mut map = self.lock();
        let conversation = map.entry(user_id.to_string()).or_insert_with(|| Conversation {
            turns: Vec::new(),
            last_activity_at: Utc::now(),
        });
        conversation.turns.push(turn);
        if conversation.turns.len() > self.limit {
            let excess = conversation.turns.len() - self.limit;
            conversation.turns.drain(..excess);
        }
        conversation.last_activity_at = Utc::now();
    }

    /// Snapshot of a user's turns, oldest first.
    pub fn history(&self, user_id: &str) -> Vec<Value> {
        self.lock()
            .get(user_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    /// Number of turns held for a user.
    pub fn turn_count(&self, user_id: &str) -> usize {
        self.lock().get(user_id).map(|c| c.turns.len()).unwrap_or(0)
    }

    /// Number of live conversations.
    pub fn conversation_count(&self) -> usize {
        self.lock().len()
    }

    /// Evict conversations idle longer than `idle`; returns how many.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(idle).unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut map = self.lock();
        let before = map.len();
        map.retain(|user_id, conversation| {
            let keep = conversation.last_activity_at > cutoff;
            if !keep {
                debug!(user_id, "evicting idle conversation");
            }
            keep
        });
        before - map.len()
    }
}

//! In-memory activity store for tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use troupe_types::activity::{ActivityRecord, LogRecord};

use crate::{ActivityStore, StoreError};

/// An [`ActivityStore`] that keeps rows in memory.
///
/// [`MemoryStore::failing`] builds one that rejects every operation, for
/// exercising the log-outage paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<ActivityRecord>>,
    logs: Mutex<Vec<LogRecord>>,
    fail: bool,
}

impl MemoryStore {
    /// A store that records everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that fails every operation.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Snapshot of recorded `agent_messages` rows.
    pub fn messages(&self) -> Vec<ActivityRecord> {
        self.messages.lock().expect("store lock poisoned").clone()
    }

    /// Snapshot of recorded `logs` rows.
    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().expect("store lock poisoned").clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail {
            Err(StoreError::Http("simulated outage".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn record_message(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        self.check()?;
        self.messages
            .lock()
            .expect("store lock poisoned")
            .push(record.clone());
        Ok(())
    }

    async fn record_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.check()?;
        self.logs
            .lock()
            .expect("store lock poisoned")
            .push(record.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        self.check()?;
        Ok(Duration::from_micros(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use troupe_types::envelope::{Envelope, MessageType};

    #[tokio::test]
    async fn records_are_retrievable() {
        let store = MemoryStore::new();
        let env = Envelope::new("gateway", "chatter", MessageType::Question, json!({}));
        store
            .record_message(&ActivityRecord::from_envelope(&env))
            .await
            .unwrap();
        assert_eq!(store.messages().len(), 1);
        assert_eq!(store.messages()[0].from_agent, "gateway");
    }

    #[tokio::test]
    async fn failing_store_rejects() {
        let store = MemoryStore::failing();
        assert!(store.ping().await.is_err());
        let env = Envelope::new("a", "b", MessageType::Status, json!({}));
        assert!(store
            .record_message(&ActivityRecord::from_envelope(&env))
            .await
            .is_err());
        assert!(store.messages().is_empty());
    }
}

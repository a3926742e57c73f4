//! # troupe-store
//!
//! Append-only activity-log persistence. Two tables: `agent_messages`
//! mirrors bus envelopes, `logs` records service diagnostics.
//!
//! Persistence is strictly best-effort everywhere: a store outage slows
//! no bus path and crashes no service. Callers either use the
//! [`spawn_record_message`] / [`spawn_record_log`] helpers, which detach
//! the write and log failures, or handle [`StoreError`] themselves.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use troupe_types::activity::{ActivityRecord, LogRecord};

pub mod rest;

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use rest::RestStore;

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryStore;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The HTTP request failed outright.
    #[error("store request failed: {0}")]
    Http(String),

    /// The store returned a non-2xx status.
    #[error("store error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
}

/// The activity-log backend interface.
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Append a row to `agent_messages`.
    async fn record_message(&self, record: &ActivityRecord) -> Result<(), StoreError>;

    /// Append a row to `logs`.
    async fn record_log(&self, record: &LogRecord) -> Result<(), StoreError>;

    /// Round-trip liveness probe.
    async fn ping(&self) -> Result<Duration, StoreError>;
}

/// A store that drops everything, for deployments without a log backend.
///
/// Reports itself healthy: an intentionally absent store should not
/// degrade the health surface.
#[derive(Debug, Default, Clone)]
pub struct NullStore;

#[async_trait]
impl ActivityStore for NullStore {
    async fn record_message(&self, _record: &ActivityRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_log(&self, _record: &LogRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        Ok(Duration::ZERO)
    }
}

/// Detach an `agent_messages` insert; failures are logged and dropped.
pub fn spawn_record_message(store: Arc<dyn ActivityStore>, record: ActivityRecord) {
    tokio::spawn(async move {
        if let Err(e) = store.record_message(&record).await {
            warn!(error = %e, from = %record.from_agent, "activity write dropped");
        }
    });
}

/// Detach a `logs` insert; failures are logged and dropped.
pub fn spawn_record_log(store: Arc<dyn ActivityStore>, record: LogRecord) {
    tokio::spawn(async move {
        if let Err(e) = store.record_log(&record).await {
            warn!(error = %e, agent = %record.agent, "log write dropped");
        }
    });
}

//! REST activity-log client.
//!
//! Talks to a PostgREST-style endpoint: rows are inserted with
//! `POST {base}/rest/v1/{table}` and the service key travels in both
//! the `apikey` and `Authorization` headers. Requests carry a short
//! timeout so a store outage cannot stall callers beyond a bound.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use troupe_types::activity::{ActivityRecord, LogRecord};
use troupe_types::config::StoreSettings;

use crate::{ActivityStore, StoreError};

/// Table holding envelope mirrors.
const MESSAGES_TABLE: &str = "agent_messages";

/// Table holding service diagnostics.
const LOGS_TABLE: &str = "logs";

/// Bound on any single store request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How much of an error body is kept for diagnostics.
const BODY_SNIPPET: usize = 512;

/// REST-backed [`ActivityStore`].
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RestStore {
    /// Build a client for the configured endpoint.
    pub fn new(settings: &StoreSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    async fn insert<T: serde::Serialize>(&self, table: &str, row: &T) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Prefer", "return=minimal")
            .json(row)
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(BODY_SNIPPET);
            return Err(StoreError::Api { status, body });
        }
        debug!(table, "row inserted");
        Ok(())
    }
}

#[async_trait]
impl ActivityStore for RestStore {
    async fn record_message(&self, record: &ActivityRecord) -> Result<(), StoreError> {
        self.insert(MESSAGES_TABLE, record).await
    }

    async fn record_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.insert(LOGS_TABLE, record).await
    }

    async fn ping(&self) -> Result<Duration, StoreError> {
        let start = Instant::now();
        let response = self
            .client
            .get(format!("{}?select=created_at&limit=1", self.table_url(MESSAGES_TABLE)))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| StoreError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(BODY_SNIPPET);
            return Err(StoreError::Api { status, body });
        }
        Ok(start.elapsed())
    }
}

impl std::fmt::Debug for RestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestStore")
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

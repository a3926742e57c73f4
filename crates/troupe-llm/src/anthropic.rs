//! Anthropic Messages API client.
//!
//! Tool use requires the native Messages format, so requests carry the
//! tool catalog as-is and responses come back as raw content blocks.
//! Rate limits and server errors get one retry after a short delay;
//! anything else surfaces to the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use troupe_types::config::LlmSettings;

use crate::{ChatModel, LlmError, ModelReply};

/// Default base URL for the Anthropic API.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Wire protocol version header.
const API_VERSION: &str = "2023-06-01";

/// Completion token budget per request.
const MAX_TOKENS: u32 = 4096;

/// Delay before the single retry on 429/5xx.
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// How much of an error body is kept for diagnostics.
const BODY_SNIPPET: usize = 512;

/// [`ChatModel`] backed by the Anthropic Messages API.
pub struct AnthropicModel {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl AnthropicModel {
    /// Build a client for the configured model.
    pub fn new(settings: &LlmSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Override the base URL (for testing with mock servers).
    #[cfg(test)]
    fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    async fn request_once(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        self.client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Http(e.to_string()))
    }
}

#[async_trait]
impl ChatModel for AnthropicModel {
    async fn complete(
        &self,
        system: &str,
        messages: &[Value],
        tools: &[Value],
    ) -> Result<ModelReply, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "system": system,
            "messages": messages,
            "tools": tools,
        });

        let mut response = self.request_once(&body).await?;
        let mut status = response.status().as_u16();

        if status == 429 || status >= 500 {
            warn!(status, "provider throttled or errored, retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            response = self.request_once(&body).await?;
            status = response.status().as_u16();
        }

        if !(200..300).contains(&status) {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(BODY_SNIPPET);
            return Err(LlmError::Api { status, body });
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

        let stop_reason = reply
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let content = reply
            .get("content")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        debug!(model = %self.model, %stop_reason, blocks = content.len(), "model reply");
        Ok(ModelReply { stop_reason, content })
    }
}

impl std::fmt::Debug for AnthropicModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicModel")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"***")
            .finish()
    }
}

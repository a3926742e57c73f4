//! # troupe-llm
//!
//! The LLM provider boundary. The orchestrator talks to a [`ChatModel`];
//! production wires in [`AnthropicModel`], tests script their own.
//!
//! Content blocks stay as raw [`serde_json::Value`] in the provider's
//! Messages format (`text` and `tool_use` blocks): the orchestrator
//! feeds assistant blocks back verbatim on the next turn, and a typed
//! intermediate representation would only lose fields.

use async_trait::async_trait;
use serde_json::Value;

pub mod anthropic;

pub use anthropic::AnthropicModel;

/// Errors from provider calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// The HTTP request failed outright.
    #[error("llm request failed: {0}")]
    Http(String),

    /// The provider returned a non-2xx status.
    #[error("llm error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// The response body could not be parsed.
    #[error("invalid llm response: {0}")]
    InvalidResponse(String),
}

/// One assistant reply.
#[derive(Debug, Clone)]
pub struct ModelReply {
    /// Why the model stopped (`end_turn`, `tool_use`, ...).
    pub stop_reason: String,

    /// Content blocks in the provider's wire shape.
    pub content: Vec<Value>,
}

impl ModelReply {
    /// Whether the model requested tool execution.
    pub fn wants_tools(&self) -> bool {
        self.stop_reason == "tool_use"
    }

    /// The `tool_use` blocks, in source order.
    pub fn tool_calls(&self) -> Vec<&Value> {
        self.content
            .iter()
            .filter(|block| block.get("type").and_then(|v| v.as_str()) == Some("tool_use"))
            .collect()
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        let mut text = String::new();
        for block in &self.content {
            if block.get("type").and_then(|v| v.as_str()) == Some("text") {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
            }
        }
        text
    }
}

/// A conversational model with tool use.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce the next assistant reply for `messages` given the fixed
    /// `system` directive and `tools` catalog.
    async fn complete(
        &self,
        system: &str,
        messages: &[Value],
        tools: &[Value],
    ) -> Result<ModelReply, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_concatenates_blocks() {
        let reply = ModelReply {
            stop_reason: "end_turn".into(),
            content: vec![
                json!({"type": "text", "text": "a"}),
                json!({"type": "tool_use", "id": "1", "name": "x", "input": {}}),
                json!({"type": "text", "text": "b"}),
            ],
        };
        assert_eq!(reply.text(), "a\nb");
        assert!(!reply.wants_tools());
    }

    #[test]
    fn tool_calls_in_source_order() {
        let reply = ModelReply {
            stop_reason: "tool_use".into(),
            content: vec![
                json!({"type": "tool_use", "id": "1", "name": "first", "input": {}}),
                json!({"type": "text", "text": "thinking"}),
                json!({"type": "tool_use", "id": "2", "name": "second", "input": {}}),
            ],
        };
        assert!(reply.wants_tools());
        let calls = reply.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["name"], "first");
        assert_eq!(calls[1]["name"], "second");
    }

    #[test]
    fn empty_content_yields_empty_text() {
        let reply = ModelReply {
            stop_reason: "end_turn".into(),
            content: vec![],
        };
        assert_eq!(reply.text(), "");
        assert!(reply.tool_calls().is_empty());
    }
}

//! LLM provider seam.
//!
//! The vendor client is an external collaborator; the core only needs a
//! single chat-completion capability with forced tool choice. Hosts
//! implement [`LlmProvider`] over their vendor SDK and may wrap it in
//! [`retry::RetryingProvider`] when the SDK does not already retry
//! transient failures.

pub mod retry;

pub use retry::RetryingProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// A chat message in a completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A tool the model may (or must) call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub input_schema: Value,
}

/// Tool-choice constraint for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    /// Force a call to the named tool.
    Tool { name: String },
}

/// One chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: Option<ToolChoice>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            max_tokens: 1024,
            tools: Vec::new(),
            tool_choice: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_forced_tool(mut self, tool: ToolDefinition) -> Self {
        self.tool_choice = Some(ToolChoice::Tool {
            name: tool.name.clone(),
        });
        self.tools.push(tool);
        self
    }
}

/// A block of model output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Value },
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// One chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub model: String,
    pub stop_reason: Option<String>,
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
}

impl ChatResponse {
    /// First tool-use block with the given name, if any.
    pub fn tool_call(&self, name: &str) -> Option<&Value> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse {
                name: block_name,
                input,
                ..
            } if block_name == name => Some(input),
            _ => None,
        })
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Chat+tool capability implemented over the host's vendor client.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

#[async_trait]
impl<P: LlmProvider + ?Sized> LlmProvider for std::sync::Arc<P> {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        (**self).complete(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_tool_sets_choice_and_registers_tool() {
        let tool = ToolDefinition {
            name: "classify_email".to_string(),
            description: "Classify an email".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        };
        let request = ChatRequest::new("model-x", vec![ChatMessage::user("hi")])
            .with_forced_tool(tool)
            .with_max_tokens(512);

        assert_eq!(request.tools.len(), 1);
        assert_eq!(
            request.tool_choice,
            Some(ToolChoice::Tool {
                name: "classify_email".to_string()
            })
        );
        assert_eq!(request.max_tokens, 512);
    }

    #[test]
    fn response_extracts_named_tool_call() {
        let response = ChatResponse {
            model: "model-x".to_string(),
            stop_reason: Some("tool_use".to_string()),
            content: vec![
                ContentBlock::Text {
                    text: "thinking".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "classify_email".to_string(),
                    input: serde_json::json!({"folder": "Archive"}),
                },
            ],
            usage: Usage::default(),
        };

        assert_eq!(response.tool_call("classify_email").unwrap()["folder"], "Archive");
        assert!(response.tool_call("other_tool").is_none());
        assert_eq!(response.text(), "thinking");
    }

    #[test]
    fn content_block_serde_tagging() {
        let block = ContentBlock::ToolUse {
            id: "t1".to_string(),
            name: "classify_email".to_string(),
            input: serde_json::json!({}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_use");
        assert_eq!(value["name"], "classify_email");
    }
}

//! Common types for provider interactions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request for one provider round
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    /// Single user prompt with no tools (title generation and similar one-shots)
    pub fn prompt(text: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            system: None,
            messages: vec![ChatMessage::user(text)],
            tools: Vec::new(),
            max_tokens: Some(max_tokens),
        }
    }
}

/// Message role as understood by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

/// Message in the history sent to the provider
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    /// Only set on assistant messages
    pub tool_calls: Vec<ToolCallRequest>,
    /// Only set on tool messages
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool invocation requested by the provider.
///
/// `arguments` is the raw JSON text exactly as streamed; it is not parsed
/// until the tool consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

/// Tool definition advertised to the provider
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One fragment of a tool call as it arrives on the stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCallDelta {
    /// Zero-based slot the fragment belongs to
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Incremental event of a streamed provider round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Text(String),
    ToolCall(ToolCallDelta),
    RoundEnd,
}

impl StreamDelta {
    pub fn text(s: impl Into<String>) -> Self {
        StreamDelta::Text(s.into())
    }

    #[allow(dead_code)] // Constructor used by tests and mock providers
    pub fn tool_call(
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        StreamDelta::ToolCall(ToolCallDelta {
            index,
            id: id.map(String::from),
            name: name.map(String::from),
            arguments: arguments.map(String::from),
        })
    }
}

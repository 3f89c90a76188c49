//! Database schema and types

use crate::llm::{ChatMessage, MessageRole, ToolCallRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    title TEXT NOT NULL,
    title_generated BOOLEAN NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS turns (
    turn_id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    tool_call_id TEXT,
    incomplete BOOLEAN NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_turns_session_seq ON turns(session_id, sequence_id);
";

/// Title every session starts with until a generated one replaces it
pub const PLACEHOLDER_TITLE: &str = "New chat";

/// Session record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub title_generated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turn_count: i64,
}

/// Role of a persisted turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::System => write!(f, "system"),
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
            TurnRole::Tool => write!(f, "tool"),
        }
    }
}

impl TurnRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(TurnRole::System),
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            "tool" => Some(TurnRole::Tool),
            _ => None,
        }
    }
}

impl From<TurnRole> for MessageRole {
    fn from(role: TurnRole) -> Self {
        match role {
            TurnRole::System => MessageRole::System,
            TurnRole::User => MessageRole::User,
            TurnRole::Assistant => MessageRole::Assistant,
            TurnRole::Tool => MessageRole::Tool,
        }
    }
}

/// Turn to be appended. The store assigns id, sequence and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_call_id: Option<String>,
    pub incomplete: bool,
}

impl NewTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            incomplete: false,
        }
    }

    pub fn assistant(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: text.into(),
            tool_calls,
            tool_call_id: None,
            incomplete: false,
        }
    }

    /// Partial assistant text from a round the provider broke off
    pub fn assistant_incomplete(text: impl Into<String>) -> Self {
        Self {
            incomplete: true,
            ..Self::assistant(text, Vec::new())
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Tool,
            content: output.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            incomplete: false,
        }
    }
}

/// Persisted, immutable transcript entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub turn_id: String,
    pub session_id: String,
    pub sequence_id: i64,
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub incomplete: bool,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// Convert to the provider-facing message form
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.into(),
            content: self.content.clone(),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: self.tool_call_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trips_through_text() {
        for role in [
            TurnRole::System,
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::Tool,
        ] {
            assert_eq!(TurnRole::parse(&role.to_string()), Some(role));
        }
        assert_eq!(TurnRole::parse("agent"), None);
    }

    #[test]
    fn test_incomplete_turn_drops_tool_calls() {
        let turn = NewTurn::assistant_incomplete("half an ans");
        assert_eq!(turn.role, TurnRole::Assistant);
        assert!(turn.incomplete);
        assert!(turn.tool_calls.is_empty());
    }
}

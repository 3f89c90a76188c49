//! API request and response types

use crate::db::{Session, Turn};
use crate::tools::ResourceContext;
use serde::{Deserialize, Serialize};

/// Request to run one chat turn
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub model_override: Option<String>,
    #[serde(default)]
    pub context: ResourceContext,
}

/// Response with a list of sessions
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Response with a session and its transcript
#[derive(Debug, Serialize)]
pub struct SessionWithTurnsResponse {
    pub session: Session,
    pub turns: Vec<Turn>,
    pub active: bool,
}

/// Response for cancel action
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub default: String,
    /// Accepted overrides; empty means any model id is accepted
    pub allowed: Vec<String>,
    pub available: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_body_defaults() {
        let body: ChatBody = serde_json::from_str(r#"{"message": "list pods"}"#).unwrap();
        assert!(body.session_id.is_none());
        assert!(body.model_override.is_none());
        assert!(body.context.is_empty());

        let body: ChatBody = serde_json::from_str(
            r#"{"session_id": "s-1", "message": "scale it", "context": {"kind": "Deployment", "name": "web"}}"#,
        )
        .unwrap();
        assert_eq!(body.session_id.as_deref(), Some("s-1"));
        assert!(body.context.is_scalable());
    }
}

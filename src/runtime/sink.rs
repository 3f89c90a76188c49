//! Ordered, bounded event channel to the caller

use crate::llm::ToolCallRequest;
use crate::tools::ToolOutput;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;

/// Status sent when a round's tool calls start executing
pub const STATUS_EXECUTING_TOOLS: &str = "Executing tools...";
/// Status sent when a turn stops on cancellation
pub const STATUS_CANCELLED: &str = "Cancelled";

/// Events delivered to the caller, in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Session { session_id: String },
    Message { content: String },
    Status { status: String },
    Error { error: String },
    Done,
}

impl ChatEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Error { .. } | ChatEvent::Done)
    }
}

/// The receiving side went away
#[derive(Debug, Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Producer half of the event channel.
///
/// Backed by a bounded channel: a slow consumer blocks the producer rather
/// than buffering without limit or dropping events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, event: ChatEvent) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    pub async fn status(&self, status: &str) -> Result<(), SinkClosed> {
        self.send(ChatEvent::Status {
            status: status.to_string(),
        })
        .await
    }

    pub async fn error(&self, error: impl Into<String>) -> Result<(), SinkClosed> {
        self.send(ChatEvent::Error {
            error: error.into(),
        })
        .await
    }

    pub async fn done(&self) -> Result<(), SinkClosed> {
        self.send(ChatEvent::Done).await
    }
}

/// Inline marker announcing a tool call
pub fn tool_call_block(call: &ToolCallRequest) -> String {
    let body = json!({
        "id": call.id,
        "name": call.name,
        "arguments": call.arguments,
    });
    format!("<tool_call>{body}</tool_call>")
}

/// Inline marker carrying a tool result
pub fn tool_result_block(call: &ToolCallRequest, output: &ToolOutput) -> String {
    let body = json!({
        "id": call.id,
        "name": call.name,
        "success": output.success,
        "output": output.output,
    });
    format!("<tool_result>{body}</tool_result>")
}

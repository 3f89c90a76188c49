//! Mock implementations for testing
//!
//! These mocks let the turn loop and runtime manager run without real I/O.

use super::traits::*;
use crate::db::{NewTurn, Turn};
use crate::llm::{DeltaStream, LlmError, LlmRequest, LlmService, StreamDelta};
use crate::tools::{Tool, ToolContext, ToolError};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock Provider
// ============================================================================

/// One scripted provider round
pub enum MockRound {
    /// Stream these items, then end
    Stream(Vec<Result<StreamDelta, LlmError>>),
    /// Stream these items, then never yield again
    Hang(Vec<StreamDelta>),
    /// Fail to open the round
    OpenError(LlmError),
}

impl MockRound {
    /// Plain text answer split into the given fragments
    pub fn text(fragments: &[&str]) -> Self {
        let mut items: Vec<_> = fragments.iter().map(|f| Ok(StreamDelta::text(*f))).collect();
        items.push(Ok(StreamDelta::RoundEnd));
        MockRound::Stream(items)
    }

    /// Round requesting the given `(id, name, arguments)` tool calls
    pub fn tool_calls(calls: &[(&str, &str, &str)]) -> Self {
        let mut items: Vec<_> = calls
            .iter()
            .enumerate()
            .map(|(index, (id, name, args))| {
                Ok(StreamDelta::tool_call(index, Some(*id), Some(*name), Some(*args)))
            })
            .collect();
        items.push(Ok(StreamDelta::RoundEnd));
        MockRound::Stream(items)
    }
}

/// Mock provider that replays scripted rounds
pub struct MockProvider {
    rounds: Mutex<VecDeque<MockRound>>,
    /// When the script runs out, keep requesting this tool forever
    endless_tool: Option<String>,
    titles: Mutex<VecDeque<Result<String, LlmError>>>,
    /// Record of all streaming requests made
    requests: Mutex<Vec<LlmRequest>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            rounds: Mutex::new(VecDeque::new()),
            endless_tool: None,
            titles: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Provider that requests `tool_name` in every round
    pub fn endless(tool_name: impl Into<String>) -> Self {
        Self {
            endless_tool: Some(tool_name.into()),
            ..Self::new()
        }
    }

    pub fn with_round(self, round: MockRound) -> Self {
        self.rounds.lock().unwrap().push_back(round);
        self
    }

    pub fn with_title(self, title: Result<String, LlmError>) -> Self {
        self.titles.lock().unwrap().push_back(title);
        self
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmService for MockProvider {
    async fn stream_round(&self, request: &LlmRequest) -> Result<DeltaStream, LlmError> {
        let round_number = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            requests.len()
        };

        let next = self.rounds.lock().unwrap().pop_front();
        match next {
            Some(MockRound::Stream(items)) => Ok(stream::iter(items).boxed()),
            Some(MockRound::Hang(items)) => Ok(stream::iter(items.into_iter().map(Ok::<_, LlmError>))
                .chain(stream::pending())
                .boxed()),
            Some(MockRound::OpenError(e)) => Err(e),
            None => match &self.endless_tool {
                Some(name) => {
                    let id = format!("call_{round_number}");
                    Ok(stream::iter(vec![
                        Ok(StreamDelta::tool_call(0, Some(&id), Some(name), Some("{}"))),
                        Ok(StreamDelta::RoundEnd),
                    ])
                    .boxed())
                }
                None => Err(LlmError::network("No mock round queued")),
            },
        }
    }

    async fn complete_round(&self, _request: &LlmRequest) -> Result<String, LlmError> {
        self.titles
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock title queued")))
    }

    fn model_id(&self) -> &str {
        "mock-model"
    }
}

/// Provider source handing out a fixed provider
pub struct MockProviderSource {
    provider: Option<Arc<dyn LlmService>>,
}

impl MockProviderSource {
    pub fn new(provider: Arc<dyn LlmService>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn empty() -> Self {
        Self { provider: None }
    }
}

impl ProviderSource for MockProviderSource {
    fn resolve(&self, _model_override: Option<&str>) -> Option<Arc<dyn LlmService>> {
        self.provider.clone()
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

#[derive(Default)]
struct SessionRecord {
    turns: Vec<Turn>,
    title: Option<String>,
}

/// In-memory conversation store
#[derive(Default)]
pub struct InMemoryStorage {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    appends: AtomicUsize,
    /// 1-based append that fails once
    fail_append: Mutex<Option<usize>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turns of a session, empty if it does not exist
    pub fn turns(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    pub fn title(&self, session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .and_then(|s| s.title.clone())
    }

    /// Make the `n`th append (counting from 1, across all sessions) fail
    pub fn fail_append_at(&self, n: usize) {
        *self.fail_append.lock().unwrap() = Some(n);
    }

    pub fn insert_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default();
    }
}

#[async_trait]
impl ConversationStore for InMemoryStorage {
    async fn create(&self, _owner: &str) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.insert_session(&id);
        Ok(id)
    }

    async fn load(&self, session_id: &str) -> Result<Option<Vec<Turn>>, String> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map(|s| s.turns.clone()))
    }

    async fn append_turn(&self, session_id: &str, turn: &NewTurn) -> Result<Turn, String> {
        let count = self.appends.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.fail_append.lock().unwrap() == Some(count) {
            return Err("disk full".to_string());
        }

        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session not found: {session_id}"))?;

        let stored = Turn {
            turn_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sequence_id: i64::try_from(record.turns.len()).unwrap_or(i64::MAX) + 1,
            role: turn.role,
            content: turn.content.clone(),
            tool_calls: turn.tool_calls.clone(),
            tool_call_id: turn.tool_call_id.clone(),
            incomplete: turn.incomplete,
            created_at: Utc::now(),
        };
        record.turns.push(stored.clone());
        Ok(stored)
    }

    async fn rename_once(&self, session_id: &str, title: &str) -> Result<bool, String> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| format!("Session not found: {session_id}"))?;
        if record.title.is_some() {
            return Ok(false);
        }
        record.title = Some(title.to_string());
        Ok(true)
    }
}

// ============================================================================
// Mock Tools
// ============================================================================

/// Tool that records its arguments and replies with a fixed result
pub struct RecordingTool {
    name: String,
    reply: Result<String, String>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingTool {
    pub fn ok(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: Ok(output.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reply: Err(error.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the recorded argument payloads
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Tool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Mock {}", self.name)
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn run(&self, arguments: &str, _ctx: ToolContext) -> Result<String, ToolError> {
        self.calls.lock().unwrap().push(arguments.to_string());
        self.reply.clone().map_err(ToolError::Failed)
    }
}

/// Tool that blocks until its cancellation token fires
pub struct BlockingTool;

#[async_trait]
impl Tool for BlockingTool {
    fn name(&self) -> &'static str {
        "wait_forever"
    }

    fn description(&self) -> String {
        "Blocks until cancelled".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn run(&self, _arguments: &str, ctx: ToolContext) -> Result<String, ToolError> {
        ctx.cancel.cancelled().await;
        Err(ToolError::Cancelled)
    }
}

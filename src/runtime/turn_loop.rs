//! Turn loop driving provider rounds and tool execution
//!
//! One loop serves one user message: it streams a provider round, persists
//! the assistant turn, runs any requested tools in order, and repeats until a
//! round asks for no tools or the round bound is hit.

use super::accumulator::{DeltaAccumulator, RoundOutput};
use super::sink::{
    tool_call_block, tool_result_block, ChatEvent, EventSink, STATUS_CANCELLED,
    STATUS_EXECUTING_TOOLS,
};
use super::traits::ConversationStore;
use super::ActiveGuard;
use crate::db::{NewTurn, Turn};
use crate::llm::{ChatMessage, LlmRequest, LlmService, StreamDelta, ToolCallRequest};
use crate::tools::{ResourceContext, ToolContext, ToolRegistry};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ROUNDS: usize = 50;

/// Tool output recorded for calls skipped or interrupted by cancellation
pub const CANCELLED_TOOL_OUTPUT: &str = "[Tool execution cancelled]";

/// How a turn loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// A round asked for no tools, or the round bound was reached
    Finished {
        rounds: usize,
        text: String,
        hit_round_limit: bool,
    },
    /// Provider or storage failure
    Aborted { error: String },
    /// Cancelled by the caller or the event consumer went away
    Cancelled,
}

pub struct TurnLoop<S: ConversationStore> {
    store: S,
    provider: Arc<dyn LlmService>,
    tools: ToolRegistry,
    sink: EventSink,
    cancel: CancellationToken,
    session_id: String,
    resource: ResourceContext,
    system_prompt: Option<String>,
    max_rounds: usize,
    claim: Option<ActiveGuard>,
}

impl<S: ConversationStore> TurnLoop<S> {
    pub fn new(
        store: S,
        provider: Arc<dyn LlmService>,
        tools: ToolRegistry,
        sink: EventSink,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            provider,
            tools,
            sink,
            cancel: CancellationToken::new(),
            session_id: session_id.into(),
            resource: ResourceContext::default(),
            system_prompt: None,
            max_rounds: DEFAULT_MAX_ROUNDS,
            claim: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_resource(mut self, resource: ResourceContext) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    /// Hold the session's busy claim; it is released before the terminal event
    pub(super) fn with_claim(mut self, claim: ActiveGuard) -> Self {
        self.claim = Some(claim);
        self
    }

    /// Run the loop for one user message on top of `history`.
    ///
    /// Exactly one terminal event (`done` or `error`) is emitted, unless the
    /// consumer is already gone.
    pub async fn run(mut self, history: Vec<Turn>, user_message: &str) -> LoopOutcome {
        let outcome = self.drive(history, user_message).await;

        // Nothing is written past this point; free the session before the terminal event
        drop(self.claim.take());

        match &outcome {
            LoopOutcome::Finished {
                rounds,
                text,
                hit_round_limit,
            } => {
                tracing::info!(
                    session_id = %self.session_id,
                    rounds = rounds,
                    chars = text.len(),
                    hit_round_limit = hit_round_limit,
                    "Turn finished"
                );
                let _ = self.sink.done().await;
            }
            LoopOutcome::Aborted { error } => {
                tracing::error!(session_id = %self.session_id, error = %error, "Turn aborted");
                let _ = self.sink.error(error.clone()).await;
            }
            LoopOutcome::Cancelled => {
                tracing::info!(session_id = %self.session_id, "Turn cancelled");
                // Best effort: the consumer may be the reason we stopped
                if self.sink.status(STATUS_CANCELLED).await.is_ok() {
                    let _ = self.sink.done().await;
                }
            }
        }

        outcome
    }

    async fn drive(&self, history: Vec<Turn>, user_message: &str) -> LoopOutcome {
        // Partial answers from broken rounds never go back to the provider
        let mut messages: Vec<ChatMessage> = history
            .iter()
            .filter(|turn| !turn.incomplete)
            .map(Turn::to_chat_message)
            .collect();

        let user_turn = match self.persist(&NewTurn::user(user_message)).await {
            Ok(turn) => turn,
            Err(error) => return LoopOutcome::Aborted { error },
        };
        messages.push(user_turn.to_chat_message());

        if let Err(outcome) = self
            .emit(ChatEvent::Session {
                session_id: self.session_id.clone(),
            })
            .await
        {
            return outcome;
        }

        let definitions = self.tools.definitions();
        let mut text = String::new();

        for round in 1..=self.max_rounds {
            if self.cancel.is_cancelled() {
                return LoopOutcome::Cancelled;
            }

            let request = LlmRequest {
                system: self.system_prompt.clone(),
                messages: messages.clone(),
                tools: definitions.clone(),
                max_tokens: None,
            };

            let output = match self.stream_round(&request).await {
                Ok(output) => output,
                Err(outcome) => return outcome,
            };

            let assistant = NewTurn::assistant(&output.text, output.tool_calls.clone());
            let assistant = match self.persist(&assistant).await {
                Ok(turn) => turn,
                Err(error) => return LoopOutcome::Aborted { error },
            };
            messages.push(assistant.to_chat_message());
            text.push_str(&output.text);

            tracing::debug!(
                session_id = %self.session_id,
                round = round,
                tool_calls = output.tool_calls.len(),
                "Round complete"
            );

            if output.tool_calls.is_empty() {
                return LoopOutcome::Finished {
                    rounds: round,
                    text,
                    hit_round_limit: false,
                };
            }

            match self.execute_tools(&output.tool_calls).await {
                Ok(tool_turns) => messages.extend(tool_turns.iter().map(Turn::to_chat_message)),
                Err(outcome) => return outcome,
            }
        }

        tracing::warn!(
            session_id = %self.session_id,
            max_rounds = self.max_rounds,
            "Round limit reached, finishing turn"
        );
        LoopOutcome::Finished {
            rounds: self.max_rounds,
            text,
            hit_round_limit: true,
        }
    }

    /// Stream one provider round, forwarding text as it arrives
    async fn stream_round(&self, request: &LlmRequest) -> Result<RoundOutput, LoopOutcome> {
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(LoopOutcome::Cancelled),
            result = self.provider.stream_round(request) => result,
        };
        let mut stream = opened.map_err(|e| LoopOutcome::Aborted {
            error: format!("Provider error: {}", e.message),
        })?;

        let mut accumulator = DeltaAccumulator::new();
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(LoopOutcome::Cancelled),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(StreamDelta::Text(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    accumulator.push_text(&fragment);
                    self.emit(ChatEvent::Message { content: fragment }).await?;
                }
                Some(Ok(StreamDelta::ToolCall(delta))) => accumulator.push_tool_call(delta),
                Some(Ok(StreamDelta::RoundEnd)) | None => break,
                Some(Err(e)) => {
                    self.persist_incomplete(accumulator.text()).await;
                    return Err(LoopOutcome::Aborted {
                        error: format!("Provider stream error: {}", e.message),
                    });
                }
            }
        }

        Ok(accumulator.finish())
    }

    /// Run a round's tool calls strictly in order
    async fn execute_tools(&self, calls: &[ToolCallRequest]) -> Result<Vec<Turn>, LoopOutcome> {
        let mut turns = Vec::with_capacity(calls.len());

        let status = ChatEvent::Status {
            status: STATUS_EXECUTING_TOOLS.to_string(),
        };
        if let Err(outcome) = self.emit(status).await {
            return Err(self.cancel_remaining(calls, outcome).await);
        }

        for (i, call) in calls.iter().enumerate() {
            let announce = ChatEvent::Message {
                content: tool_call_block(call),
            };
            if let Err(outcome) = self.emit(announce).await {
                return Err(self.cancel_remaining(&calls[i..], outcome).await);
            }

            let ctx = ToolContext::new(
                self.cancel.child_token(),
                self.session_id.clone(),
                self.resource.clone(),
            );
            let output = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                output = self.tools.execute(&call.name, &call.arguments, ctx) => Some(output),
            };
            let Some(output) = output else {
                return Err(self
                    .cancel_remaining(&calls[i..], LoopOutcome::Cancelled)
                    .await);
            };

            let announced = self
                .emit(ChatEvent::Message {
                    content: tool_result_block(call, &output),
                })
                .await;

            let turn = match self.persist(&NewTurn::tool(&call.id, &output.output)).await {
                Ok(turn) => turn,
                Err(error) => {
                    let outcome = LoopOutcome::Aborted { error };
                    return Err(self.cancel_remaining(&calls[i..], outcome).await);
                }
            };
            turns.push(turn);

            if let Err(outcome) = announced {
                return Err(self.cancel_remaining(&calls[i + 1..], outcome).await);
            }
        }

        Ok(turns)
    }

    /// Record a cancellation result for every call that will not run, so
    /// each requested call keeps a matching tool turn.
    async fn cancel_remaining(&self, calls: &[ToolCallRequest], outcome: LoopOutcome) -> LoopOutcome {
        for call in calls {
            if let Err(error) = self
                .persist(&NewTurn::tool(&call.id, CANCELLED_TOOL_OUTPUT))
                .await
            {
                tracing::error!(
                    session_id = %self.session_id,
                    tool_call_id = %call.id,
                    error = %error,
                    "Failed to record cancelled tool call"
                );
            }
        }
        outcome
    }

    async fn persist_incomplete(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Err(error) = self.persist(&NewTurn::assistant_incomplete(text)).await {
            tracing::error!(
                session_id = %self.session_id,
                error = %error,
                "Failed to persist partial assistant text"
            );
        }
    }

    async fn persist(&self, turn: &NewTurn) -> Result<Turn, String> {
        self.store
            .append_turn(&self.session_id, turn)
            .await
            .map_err(|e| format!("Failed to persist turn: {e}"))
    }

    /// Send an event, giving up if cancelled while blocked on a slow consumer
    async fn emit(&self, event: ChatEvent) -> Result<(), LoopOutcome> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(LoopOutcome::Cancelled),
            sent = self.sink.send(event) => sent.map_err(|_| {
                tracing::info!(session_id = %self.session_id, "Event consumer gone, stopping turn");
                LoopOutcome::Cancelled
            }),
        }
    }
}

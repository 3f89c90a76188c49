//! `OpenAI`-compatible chat completions provider with streaming support

use super::types::{ChatMessage, LlmRequest, MessageRole, StreamDelta, ToolCallDelta};
use super::{DeltaStream, LlmError, LlmService};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

const CHAT_COMPLETION_CHUNK_OBJECT: &str = "chat.completion.chunk";

/// OpenAI-compatible service implementation
pub struct OpenAIService {
    client: Client,
    api_key: String,
    endpoint: String,
    model_id: String,
}

impl OpenAIService {
    pub fn new(client: Client, api_key: String, base_url: &str, model_id: String) -> Self {
        Self {
            client,
            api_key,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model_id,
        }
    }

    fn translate_request(&self, request: &LlmRequest, stream: bool) -> OpenAIRequest {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            messages.push(OpenAIMessage {
                role: "system".to_string(),
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        messages.extend(request.messages.iter().map(Self::translate_message));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| OpenAITool {
                        r#type: "function".to_string(),
                        function: OpenAIFunction {
                            name: t.name.clone(),
                            description: t.description.clone(),
                            parameters: t.input_schema.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAIRequest {
            model: self.model_id.clone(),
            messages,
            tools,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    fn translate_message(msg: &ChatMessage) -> OpenAIMessage {
        let tool_calls = if msg.tool_calls.is_empty() {
            None
        } else {
            Some(
                msg.tool_calls
                    .iter()
                    .map(|tc| OpenAIToolCall {
                        id: tc.id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: tc.name.clone(),
                            // Providers reject an empty argument string
                            arguments: if tc.arguments.trim().is_empty() {
                                "{}".to_string()
                            } else {
                                tc.arguments.clone()
                            },
                        },
                    })
                    .collect(),
            )
        };

        // An assistant message that only carries tool calls has null content
        let content = if msg.role == MessageRole::Assistant && msg.content.is_empty() {
            None
        } else {
            Some(msg.content.clone())
        };

        OpenAIMessage {
            role: msg.role.as_str().to_string(),
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
        }
    }

    async fn send(&self, body: &OpenAIRequest) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        let message = serde_json::from_str::<OpenAIErrorResponse>(&body)
            .map_or(body, |resp| resp.error.message);

        let error = LlmError::from_status(status.as_u16(), &message);
        Err(match retry_after {
            Some(duration) => error.with_retry_after(duration),
            None => error,
        })
    }
}

#[async_trait]
impl LlmService for OpenAIService {
    async fn stream_round(&self, request: &LlmRequest) -> Result<DeltaStream, LlmError> {
        let body = self.translate_request(request, true);
        let response = self.send(&body).await?;
        Ok(delta_stream(response.bytes_stream().eventsource()))
    }

    async fn complete_round(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let body = self.translate_request(request, false);
        let response = self.send(&body).await?;

        let text = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        let parsed: OpenAIResponse = serde_json::from_str(&text).map_err(|e| {
            LlmError::unknown(format!("Failed to parse response: {e} - body: {text}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| LlmError::unknown("No choices in response"))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Stream parsing
// ============================================================================

/// What a single SSE `data:` payload contributed to the round
#[derive(Debug, PartialEq)]
enum ChunkOutcome {
    /// The `[DONE]` sentinel
    Done,
    /// Keep-alive, usage-only or foreign chunk
    Skip,
    Deltas {
        deltas: Vec<StreamDelta>,
        finished: bool,
    },
}

/// Assigns slots to tool-call fragments that arrive without an `index`.
///
/// Some compatible providers send each call whole in its own chunk and omit
/// the index. A fragment with a new id opens the next slot; one without an id
/// (or repeating the current id) continues the current slot.
#[derive(Debug, Default)]
struct SlotAssigner {
    next: usize,
    current: Option<(usize, Option<String>)>,
}

impl SlotAssigner {
    fn slot_for(&mut self, index: Option<usize>, id: Option<&str>) -> usize {
        if let Some(index) = index {
            self.next = self.next.max(index + 1);
            self.current = Some((index, id.map(String::from)));
            return index;
        }

        let id = id.filter(|id| !id.is_empty());
        if let Some((slot, current_id)) = &mut self.current {
            match id {
                None => return *slot,
                Some(id) if current_id.as_deref() == Some(id) => return *slot,
                Some(id) if current_id.is_none() => {
                    *current_id = Some(id.to_string());
                    return *slot;
                }
                Some(_) => {}
            }
        }

        let slot = self.next;
        self.next += 1;
        self.current = Some((slot, id.map(String::from)));
        slot
    }
}

fn parse_chunk(data: &str, slots: &mut SlotAssigner) -> Result<ChunkOutcome, LlmError> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(ChunkOutcome::Done);
    }
    if data.is_empty() {
        return Ok(ChunkOutcome::Skip);
    }

    let json: Value = serde_json::from_str(data)
        .map_err(|e| LlmError::unknown(format!("SSE parsing error: {e}, data: {data}")))?;

    if let Some(error) = json.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("An error occurred during streaming");
        return Err(LlmError::server_error(format!("Provider stream error: {message}")));
    }

    // Compatible providers sometimes omit `object`; only skip chunks that name another type
    if let Some(object) = json.get("object").and_then(Value::as_str) {
        if object != CHAT_COMPLETION_CHUNK_OBJECT {
            tracing::warn!(object = %object, "Skipping non-standard SSE event");
            return Ok(ChunkOutcome::Skip);
        }
    }

    let chunk: StreamChunk = serde_json::from_value(json)
        .map_err(|e| LlmError::unknown(format!("SSE data schema error: {e}, data: {data}")))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        // Final usage chunk carries `choices: []`
        return Ok(ChunkOutcome::Skip);
    };

    let mut deltas = Vec::new();
    if let Some(text) = choice.delta.content {
        if !text.is_empty() {
            deltas.push(StreamDelta::Text(text));
        }
    }
    for call in choice.delta.tool_calls.unwrap_or_default() {
        let (name, arguments) = call
            .function
            .map_or((None, None), |f| (f.name, f.arguments));
        let index = slots.slot_for(call.index, call.id.as_deref());
        deltas.push(StreamDelta::ToolCall(ToolCallDelta {
            index,
            id: call.id,
            name,
            arguments,
        }));
    }

    Ok(ChunkOutcome::Deltas {
        deltas,
        finished: choice.finish_reason.is_some(),
    })
}

struct ParserState<S> {
    events: std::pin::Pin<Box<S>>,
    pending: VecDeque<StreamDelta>,
    slots: SlotAssigner,
    saw_finish: bool,
    done: bool,
}

/// Turn a stream of SSE events into a stream of round deltas.
///
/// Ends with `RoundEnd` on `[DONE]`, or when the body closes after a
/// `finish_reason` was seen. Closing earlier is a stream error.
fn delta_stream<S, E>(events: S) -> DeltaStream
where
    S: Stream<Item = Result<eventsource_stream::Event, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = ParserState {
        events: Box::pin(events),
        pending: VecDeque::new(),
        slots: SlotAssigner::default(),
        saw_finish: false,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(delta) = st.pending.pop_front() {
                return Some((Ok(delta), st));
            }
            if st.done {
                return None;
            }

            let next = st.events.next().await;
            match next {
                Some(Ok(event)) => {
                    tracing::trace!(data = %event.data, "Provider SSE");
                    match parse_chunk(&event.data, &mut st.slots) {
                        Ok(ChunkOutcome::Done) => {
                            st.done = true;
                            st.pending.push_back(StreamDelta::RoundEnd);
                        }
                        Ok(ChunkOutcome::Skip) => {}
                        Ok(ChunkOutcome::Deltas { deltas, finished }) => {
                            st.saw_finish |= finished;
                            st.pending.extend(deltas);
                        }
                        Err(e) => {
                            st.done = true;
                            return Some((Err(e), st));
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(LlmError::network(format!("SSE stream error: {e}"))), st));
                }
                None => {
                    st.done = true;
                    if st.saw_finish {
                        st.pending.push_back(StreamDelta::RoundEnd);
                    } else {
                        return Some((
                            Err(LlmError::network(
                                "SSE stream closed before response completed",
                            )),
                            st,
                        ));
                    }
                }
            }
        }
    })
    .boxed()
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    // Serialized as an explicit null for tool-call-only assistant messages
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    r#type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorResponse {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamChoiceDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoiceDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCallRequest;

    fn sse_body(payloads: &[&str]) -> Vec<Result<Vec<u8>, std::io::Error>> {
        payloads
            .iter()
            .map(|p| Ok(format!("data: {p}\n\n").into_bytes()))
            .collect()
    }

    async fn collect(payloads: &[&str]) -> Vec<Result<StreamDelta, LlmError>> {
        let events = futures::stream::iter(sse_body(payloads)).eventsource();
        delta_stream(events).collect().await
    }

    fn parse(data: &str) -> Result<ChunkOutcome, LlmError> {
        parse_chunk(data, &mut SlotAssigner::default())
    }

    #[test]
    fn test_parse_done_sentinel() {
        assert_eq!(parse("[DONE]").unwrap(), ChunkOutcome::Done);
        assert_eq!(parse("  ").unwrap(), ChunkOutcome::Skip);
    }

    #[test]
    fn test_parse_text_and_tool_fragments() {
        let raw = r#"{
            "object": "chat.completion.chunk",
            "choices": [{
                "index": 0,
                "delta": {
                    "content": "hello",
                    "tool_calls": [
                        {"index": 1, "id": "call_b", "function": {"name": "list_pods", "arguments": "{\"na"}}
                    ]
                },
                "finish_reason": null
            }]
        }"#;

        let outcome = parse(raw).unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Deltas {
                deltas: vec![
                    StreamDelta::text("hello"),
                    StreamDelta::tool_call(1, Some("call_b"), Some("list_pods"), Some("{\"na")),
                ],
                finished: false,
            }
        );
    }

    #[test]
    fn test_parse_in_band_error() {
        let err = parse(r#"{"error": {"message": "overloaded"}}"#).unwrap_err();
        assert!(err.message.contains("overloaded"));

        let err = parse(r#"{"error": "boom"}"#).unwrap_err();
        assert!(err.message.contains("boom"));
    }

    #[test]
    fn test_parse_skips_foreign_and_usage_chunks() {
        assert_eq!(
            parse(r#"{"object": "keepalive"}"#).unwrap(),
            ChunkOutcome::Skip
        );
        assert_eq!(
            parse(r#"{"object": "chat.completion.chunk", "choices": [], "usage": {"prompt_tokens": 1}}"#)
                .unwrap(),
            ChunkOutcome::Skip
        );
    }

    #[test]
    fn test_parse_malformed_json_is_error() {
        assert!(parse("{not json").is_err());
    }

    #[tokio::test]
    async fn test_stream_ends_with_round_end_on_done() {
        let items = collect(&[
            r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            "[DONE]",
        ])
        .await;

        let deltas: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(deltas, vec![StreamDelta::text("Hi"), StreamDelta::RoundEnd]);
    }

    #[tokio::test]
    async fn test_stream_closed_after_finish_reason_still_ends_round() {
        let items = collect(&[r#"{"choices":[{"delta":{"content":"ok"},"finish_reason":"stop"}]}"#])
            .await;

        let deltas: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(deltas, vec![StreamDelta::text("ok"), StreamDelta::RoundEnd]);
    }

    #[tokio::test]
    async fn test_stream_closed_early_is_error() {
        let items = collect(&[r#"{"choices":[{"delta":{"content":"partial"},"finish_reason":null}]}"#])
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &StreamDelta::text("partial"));
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let items = collect(&[
            r#"{"choices":[{"delta":{"content":"a"},"finish_reason":null}]}"#,
            r#"{"error":{"message":"upstream reset"}}"#,
            r#"{"choices":[{"delta":{"content":"never"},"finish_reason":null}]}"#,
        ])
        .await;

        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[tokio::test]
    async fn test_unindexed_tool_calls_get_their_own_slots() {
        let items = collect(&[
            r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_a","function":{"name":"list_resources","arguments":"{\"kind\":\"pods\"}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"id":"call_b","function":{"name":"think","arguments":"{}"}}]},"finish_reason":null}]}"#,
            r#"{"choices":[{"delta":{"tool_calls":[{"function":{"arguments":""}}]},"finish_reason":"tool_calls"}]}"#,
            "[DONE]",
        ])
        .await;

        let deltas: Vec<_> = items.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            deltas,
            vec![
                StreamDelta::tool_call(0, Some("call_a"), Some("list_resources"), Some("{\"kind\":\"pods\"}")),
                StreamDelta::tool_call(1, Some("call_b"), Some("think"), Some("{}")),
                StreamDelta::tool_call(1, None, None, Some("")),
                StreamDelta::RoundEnd,
            ]
        );
    }

    #[test]
    fn test_slot_assigner_follows_explicit_indices() {
        let mut slots = SlotAssigner::default();
        assert_eq!(slots.slot_for(Some(0), Some("a")), 0);
        assert_eq!(slots.slot_for(Some(0), None), 0);
        assert_eq!(slots.slot_for(Some(1), Some("b")), 1);
        // An unindexed call after indexed ones opens a fresh slot
        assert_eq!(slots.slot_for(None, Some("c")), 2);
        assert_eq!(slots.slot_for(None, None), 2);
        assert_eq!(slots.slot_for(None, Some("c")), 2);
    }

    #[test]
    fn test_translate_history() {
        let service = OpenAIService::new(
            Client::new(),
            "key".to_string(),
            "https://example.test/v1/",
            "gpt-test".to_string(),
        );
        assert_eq!(service.endpoint, "https://example.test/v1/chat/completions");

        let request = LlmRequest {
            system: Some("be brief".to_string()),
            messages: vec![
                ChatMessage::user("list pods"),
                ChatMessage::assistant(
                    "",
                    vec![ToolCallRequest {
                        id: "call_1".to_string(),
                        name: "list_resources".to_string(),
                        arguments: String::new(),
                    }],
                ),
                ChatMessage::tool("call_1", "pod-a, pod-b"),
            ],
            tools: vec![],
            max_tokens: None,
        };

        let body = serde_json::to_value(service.translate_request(&request, true)).unwrap();
        let messages = body["messages"].as_array().unwrap();

        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert!(messages[2]["content"].is_null());
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }
}

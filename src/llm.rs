//! LLM provider abstraction
//!
//! Provides a common interface for streaming chat rounds against a
//! completion provider.

mod error;
mod openai;
mod registry;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use openai::OpenAIService;
pub use registry::{LlmConfig, ProviderRegistry};
pub use types::*;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazy, finite, single-pass sequence of deltas for one round
pub type DeltaStream = BoxStream<'static, Result<StreamDelta, LlmError>>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Open a streaming round. An `Err` here means the round never started.
    async fn stream_round(&self, request: &LlmRequest) -> Result<DeltaStream, LlmError>;

    /// Non-streaming completion returning only the text
    async fn complete_round(&self, request: &LlmRequest) -> Result<String, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn stream_round(&self, request: &LlmRequest) -> Result<DeltaStream, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.stream_round(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    "LLM stream opened"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    retry_after_ms = ?e.retry_after.map(|d| d.as_millis()),
                    "LLM stream failed to open"
                );
            }
        }

        result
    }

    async fn complete_round(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.complete_round(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(text) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    chars = text.len(),
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

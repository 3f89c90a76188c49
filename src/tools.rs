//! Tool implementations for kube-assist
//!
//! Tools are stateless; everything a call needs arrives through `ToolContext`.
//! A `ToolRegistry` is assembled per request so the advertised set can depend
//! on the resource the dashboard has bound.

mod cluster;
mod context;
mod think;

pub use cluster::{ClusterClient, GetResourceTool, ListResourcesTool, ScaleWorkloadTool};
pub use context::DescribeContextTool;
pub use think::ThinkTool;

use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// Failure reported by a tool. The registry turns it into output text.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
    #[error("cancelled")]
    Cancelled,
}

/// Dashboard resource the conversation is looking at
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceContext {
    pub route: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ResourceContext {
    pub fn is_empty(&self) -> bool {
        self.route.is_empty()
            && self.kind.is_empty()
            && self.name.is_empty()
            && self.namespace.is_empty()
    }

    /// Whether the bound resource is a workload the scale tool may target
    pub fn is_scalable(&self) -> bool {
        !self.name.trim().is_empty()
            && matches!(
                self.kind.trim().to_ascii_lowercase().as_str(),
                "deployment" | "deployments" | "statefulset" | "statefulsets"
            )
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The session this tool is executing within
    pub session_id: String,

    /// Resource bound by the dashboard for this request
    pub resource: ResourceContext,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, session_id: String, resource: ResourceContext) -> Self {
        Self {
            cancel,
            session_id,
            resource,
        }
    }
}

/// Trait for tools the provider may call
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }

    /// Execute the tool with the raw JSON argument text.
    ///
    /// Tools doing I/O should watch `ctx.cancel` and return
    /// `ToolError::Cancelled` when it fires.
    async fn run(&self, arguments: &str, ctx: ToolContext) -> Result<String, ToolError>;
}

/// Parse raw argument text, treating an empty payload as `{}`
pub fn parse_args<T: DeserializeOwned>(arguments: &str) -> Result<T, ToolError> {
    let trimmed = arguments.trim();
    let text = if trimmed.is_empty() { "{}" } else { trimmed };
    serde_json::from_str(text).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// Ordered collection of the tools advertised for one request
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard tool set for a request.
    ///
    /// Cluster tools need a configured cluster client; the mutating scale
    /// tool is only offered when a scalable workload is bound.
    pub fn for_request(resource: &ResourceContext, cluster: Option<Arc<ClusterClient>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ThinkTool));
        registry.register(Arc::new(DescribeContextTool));

        if let Some(client) = cluster {
            registry.register(Arc::new(ListResourcesTool::new(client.clone())));
            registry.register(Arc::new(GetResourceTool::new(client.clone())));
            if resource.is_scalable() {
                registry.register(Arc::new(ScaleWorkloadTool::new(client)));
            }
        }

        registry
    }

    /// Register a tool. A tool with the same name is replaced in place.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        match self.tools.iter().position(|t| t.name() == tool.name()) {
            Some(index) => self.tools[index] = tool,
            None => self.tools.push(tool),
        }
    }

    /// Names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Get all tool definitions for LLM, in registration order
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    /// Execute a tool by name.
    ///
    /// Never fails: unknown names and tool errors come back as error text
    /// for the provider to read.
    pub async fn execute(&self, name: &str, arguments: &str, ctx: ToolContext) -> ToolOutput {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            tracing::warn!(tool = %name, "Provider requested unknown tool");
            return ToolOutput::error(format!(
                "Error: unknown tool '{name}'. Available tools: {}",
                self.names().join(", ")
            ));
        };

        let session_id = ctx.session_id.clone();
        let start = Instant::now();
        let result = tool.run(arguments, ctx).await;
        let duration_ms = start.elapsed().as_millis();

        match result {
            Ok(output) => {
                tracing::info!(
                    session_id = %session_id,
                    tool = %name,
                    duration_ms = %duration_ms,
                    "Tool executed"
                );
                ToolOutput::success(output)
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    tool = %name,
                    duration_ms = %duration_ms,
                    error = %e,
                    "Tool failed"
                );
                ToolOutput::error(format!("Error: {e}"))
            }
        }
    }
}

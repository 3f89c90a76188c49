//! Reports the dashboard resource bound to the conversation

use super::{Tool, ToolContext, ToolError};
use async_trait::async_trait;
use serde_json::{json, Value};

pub struct DescribeContextTool;

#[async_trait]
impl Tool for DescribeContextTool {
    fn name(&self) -> &'static str {
        "describe_context"
    }

    fn description(&self) -> String {
        "Return the dashboard page and resource (kind, name, namespace) the user is currently looking at. Call this when the user refers to \"this\" resource.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn run(&self, _arguments: &str, ctx: ToolContext) -> Result<String, ToolError> {
        if ctx.resource.is_empty() {
            return Ok("No resource is bound to this conversation.".to_string());
        }
        serde_json::to_string_pretty(&ctx.resource).map_err(|e| ToolError::Failed(e.to_string()))
    }
}

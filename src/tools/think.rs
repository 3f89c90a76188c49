//! Think tool - lets the model reason out loud without side effects

use super::{parse_args, Tool, ToolContext, ToolError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Think tool for LLM reasoning
pub struct ThinkTool;

#[derive(Debug, Deserialize)]
struct ThinkInput {
    #[allow(dead_code)] // Deserialized for validation only
    thoughts: String,
}

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &'static str {
        "think"
    }

    fn description(&self) -> String {
        "Reason through a problem before acting: plan which cluster resources to inspect, interpret unexpected output, or weigh whether a change is safe. No side effects and not shown to the user.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["thoughts"],
            "properties": {
                "thoughts": {
                    "type": "string",
                    "description": "The thoughts, notes, or plans to record"
                }
            }
        })
    }

    async fn run(&self, arguments: &str, _ctx: ToolContext) -> Result<String, ToolError> {
        parse_args::<ThinkInput>(arguments)?;
        Ok("recorded".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::test_context;

    #[tokio::test]
    async fn test_think_records() {
        let result = ThinkTool
            .run(r#"{"thoughts": "Check the pods first"}"#, test_context())
            .await
            .unwrap();
        assert_eq!(result, "recorded");
    }

    #[tokio::test]
    async fn test_think_missing_thoughts() {
        let result = ThinkTool.run("", test_context()).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }
}

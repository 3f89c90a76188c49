//! Session title generation
//!
//! Derives a short title from the first message of a new session. Runs
//! detached from the request and only ever logs its failures.

use crate::llm::{LlmRequest, LlmService};
use crate::runtime::ConversationStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TITLE_PROMPT: &str = r#"Generate a very short (3-6 words) title summarizing this request. Output only the title, no quotes or punctuation. Examples:
- "why is my nginx pod crashlooping" -> Nginx Pod CrashLoop Debugging
- "scale the api deployment to 5 replicas" -> Scaling API Deployment
- "which nodes are under memory pressure?" -> Node Memory Pressure Check

Request:"#;

const TITLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TITLE_LENGTH: usize = 60;
const MAX_PROMPT_CHARS: usize = 500;

/// Generate a title for a session based on its first message.
///
/// Returns None if generation fails (timeout, provider error, empty output).
pub async fn generate_title(message_text: &str, llm_service: Arc<dyn LlmService>) -> Option<String> {
    let truncated: String = if message_text.chars().count() > MAX_PROMPT_CHARS {
        let head: String = message_text.chars().take(MAX_PROMPT_CHARS).collect();
        format!("{head}...")
    } else {
        message_text.to_string()
    };

    let request = LlmRequest::prompt(format!("{TITLE_PROMPT}\n{truncated}"), 50);

    match timeout(TITLE_TIMEOUT, llm_service.complete_round(&request)).await {
        Ok(Ok(text)) => sanitize_title(&text),
        Ok(Err(e)) => {
            tracing::warn!(error = %e.message, "Title generation LLM error");
            None
        }
        Err(_) => {
            tracing::warn!("Title generation timed out");
            None
        }
    }
}

/// Generate a title and store it on the session, logging any failure
pub async fn generate_and_apply<S: ConversationStore>(
    store: S,
    llm_service: Arc<dyn LlmService>,
    session_id: String,
    message_text: String,
) {
    let Some(title) = generate_title(&message_text, llm_service).await else {
        return;
    };

    match store.rename_once(&session_id, &title).await {
        Ok(true) => tracing::info!(session_id = %session_id, title = %title, "Session titled"),
        Ok(false) => tracing::debug!(session_id = %session_id, "Session already titled"),
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to store title"),
    }
}

/// Clean up a model-produced title
/// - Keep letters, digits, whitespace and `-`
/// - Collapse whitespace
/// - Truncate to max length on a word boundary
fn sanitize_title(title: &str) -> Option<String> {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
        .collect();

    let mut result = String::new();
    for word in cleaned.split_whitespace() {
        let extra = usize::from(!result.is_empty()) + word.chars().count();
        if result.chars().count() + extra > MAX_TITLE_LENGTH {
            if result.is_empty() {
                result = word.chars().take(MAX_TITLE_LENGTH).collect();
            }
            break;
        }
        if !result.is_empty() {
            result.push(' ');
        }
        result.push_str(word);
    }

    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::runtime::testing::{InMemoryStorage, MockProvider};

    #[test]
    fn test_sanitize_title() {
        assert_eq!(
            sanitize_title("\"Nginx Pod CrashLoop Debugging\"").as_deref(),
            Some("Nginx Pod CrashLoop Debugging")
        );
        assert_eq!(
            sanitize_title("What's the node-pressure?").as_deref(),
            Some("Whats the node-pressure")
        );
        assert_eq!(
            sanitize_title("  Multiple   Spaces \n").as_deref(),
            Some("Multiple Spaces")
        );
        assert_eq!(sanitize_title("!!! ..."), None);
    }

    #[test]
    fn test_sanitize_title_truncation() {
        let long_title =
            "This is a very long title that should be truncated at some word boundary point";
        let result = sanitize_title(long_title).unwrap();
        assert!(result.chars().count() <= MAX_TITLE_LENGTH);
        assert!(long_title.starts_with(&result));
        assert!(!result.ends_with(' '));

        let one_word = "x".repeat(100);
        assert_eq!(sanitize_title(&one_word).unwrap().len(), MAX_TITLE_LENGTH);
    }

    #[tokio::test]
    async fn test_generate_and_apply_renames_once() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_session("s-1");
        let provider = Arc::new(
            MockProvider::new()
                .with_title(Ok("Listing Pods".to_string()))
                .with_title(Ok("Second Title".to_string())),
        );

        generate_and_apply(storage.clone(), provider.clone(), "s-1".into(), "list pods".into()).await;
        generate_and_apply(storage.clone(), provider, "s-1".into(), "again".into()).await;

        assert_eq!(storage.title("s-1").as_deref(), Some("Listing Pods"));
    }

    #[tokio::test]
    async fn test_provider_failure_leaves_title_unset() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_session("s-1");
        let provider = Arc::new(MockProvider::new().with_title(Err(LlmError::rate_limit("slow down"))));

        generate_and_apply(storage.clone(), provider, "s-1".into(), "hi".into()).await;

        assert!(storage.title("s-1").is_none());
    }
}

//! Provider registry resolving the model used for a request

use super::{LlmService, LoggingService, OpenAIService};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Configuration for the completion provider
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
    /// Models accepted as a per-request override; empty accepts any
    pub allowed_models: Vec<String>,
}

impl LlmConfig {
    /// Build from any key lookup; empty values count as unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            api_key: get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            base_url: get("LLM_BASE_URL"),
            default_model: get("LLM_MODEL"),
            allowed_models: get("LLM_ALLOWED_MODELS")
                .map(|v| parse_model_list(&v))
                .unwrap_or_default(),
        }
    }
}

fn parse_model_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

/// Registry of provider services keyed by model ID.
///
/// Services are created lazily the first time a model is requested and
/// shared afterwards.
pub struct ProviderRegistry {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    allowed_models: Vec<String>,
    services: Mutex<HashMap<String, Arc<dyn LlmService>>>,
}

impl ProviderRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                Client::new()
            });

        Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            default_model: config
                .default_model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            allowed_models: config.allowed_models.clone(),
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a provider can be reached at all
    pub fn has_provider(&self) -> bool {
        self.api_key.is_some()
    }

    /// Get the default model ID
    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// Models accepted as an override (empty means any)
    pub fn allowed_models(&self) -> &[String] {
        &self.allowed_models
    }

    /// Resolve the service for an optional model override.
    ///
    /// Returns `None` when no API key is configured or the override is not
    /// in the allow-list.
    pub fn resolve(&self, model_override: Option<&str>) -> Option<Arc<dyn LlmService>> {
        let api_key = self.api_key.as_ref()?;
        let model = match model_override.map(str::trim).filter(|m| !m.is_empty()) {
            Some(m) if self.is_allowed(m) => m,
            Some(m) => {
                tracing::warn!(model = %m, "Rejected model override not in allow-list");
                return None;
            }
            None => self.default_model.as_str(),
        };

        let mut services = match self.services.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let service = services.entry(model.to_string()).or_insert_with(|| {
            let inner: Arc<dyn LlmService> = Arc::new(OpenAIService::new(
                self.client.clone(),
                api_key.clone(),
                &self.base_url,
                model.to_string(),
            ));
            Arc::new(LoggingService::new(inner))
        });
        Some(service.clone())
    }

    fn is_allowed(&self, model: &str) -> bool {
        model == self.default_model
            || self.allowed_models.is_empty()
            || self.allowed_models.iter().any(|m| m == model)
    }
}

//! Kube Assist - LLM-powered assistant for a Kubernetes dashboard
//!
//! A Rust backend running bounded tool-calling turns against an
//! OpenAI-compatible provider and streaming them to the dashboard.

mod api;
mod config;
mod db;
mod llm;
mod runtime;
mod system_prompt;
mod title_generator;
mod tools;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use llm::ProviderRegistry;
use runtime::{ConversationStore, DatabaseStorage, ProviderSource, RuntimeManager};
use std::net::SocketAddr;
use std::sync::Arc;
use tools::ClusterClient;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kube_assist=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let db = Database::open(&config.db_path)?;

    // Close tool calls left dangling by a crash
    let repaired = db.repair_orphaned_tool_calls()?;
    if repaired > 0 {
        tracing::warn!(repaired, "Repaired interrupted tool calls");
    }

    let providers = Arc::new(ProviderRegistry::new(&config.llm));
    if providers.has_provider() {
        tracing::info!(
            default = %providers.default_model_id(),
            allowed = ?providers.allowed_models(),
            "LLM provider configured"
        );
    } else {
        tracing::warn!("No LLM API key configured. Set LLM_API_KEY or OPENAI_API_KEY.");
    }

    let cluster = match &config.cluster {
        Some(cluster) => {
            tracing::info!(api_url = %cluster.api_url, "Cluster tools enabled");
            Some(Arc::new(ClusterClient::new(
                &cluster.api_url,
                cluster.token.clone(),
            )))
        }
        None => {
            tracing::warn!("KUBE_API_URL not set, cluster tools disabled");
            None
        }
    };

    let store: Arc<dyn ConversationStore> = Arc::new(DatabaseStorage::new(db.clone()));
    let provider_source: Arc<dyn ProviderSource> = providers.clone();
    let runtime = Arc::new(RuntimeManager::new(
        store,
        provider_source,
        cluster,
        config.max_rounds,
    ));

    let state = AppState::new(runtime, db, providers);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Kube Assist server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

//! HTTP API for the dashboard assistant

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::llm::ProviderRegistry;
use crate::runtime::RuntimeManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeManager>,
    pub db: Database,
    pub providers: Arc<ProviderRegistry>,
}

impl AppState {
    pub fn new(runtime: Arc<RuntimeManager>, db: Database, providers: Arc<ProviderRegistry>) -> Self {
        Self {
            runtime,
            db,
            providers,
        }
    }
}

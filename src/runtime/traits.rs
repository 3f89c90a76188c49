//! Trait abstractions for runtime I/O
//!
//! These traits let the turn loop run against mock implementations in tests.

use crate::db::{Database, DbError, NewTurn, Turn};
use crate::llm::{LlmService, ProviderRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Append-only transcript storage
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a new session and return its ID
    async fn create(&self, owner: &str) -> Result<String, String>;

    /// Load a session's turns in order. `None` if the session does not exist.
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Turn>>, String>;

    /// Append one turn to the session
    async fn append_turn(&self, session_id: &str, turn: &NewTurn) -> Result<Turn, String>;

    /// Set the generated title unless one was already set
    async fn rename_once(&self, session_id: &str, title: &str) -> Result<bool, String>;
}

/// Resolves the provider used for a request
pub trait ProviderSource: Send + Sync {
    fn resolve(&self, model_override: Option<&str>) -> Option<Arc<dyn LlmService>>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ConversationStore + ?Sized> ConversationStore for Arc<T> {
    async fn create(&self, owner: &str) -> Result<String, String> {
        (**self).create(owner).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<Vec<Turn>>, String> {
        (**self).load(session_id).await
    }

    async fn append_turn(&self, session_id: &str, turn: &NewTurn) -> Result<Turn, String> {
        (**self).append_turn(session_id, turn).await
    }

    async fn rename_once(&self, session_id: &str, title: &str) -> Result<bool, String> {
        (**self).rename_once(session_id, title).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a ConversationStore
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn create(&self, owner: &str) -> Result<String, String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_session(&id, owner)
            .map(|session| session.id)
            .map_err(|e| e.to_string())
    }

    async fn load(&self, session_id: &str) -> Result<Option<Vec<Turn>>, String> {
        match self.db.get_session(session_id) {
            Ok(_) => self.db.get_turns(session_id).map(Some).map_err(|e| e.to_string()),
            Err(DbError::SessionNotFound(_)) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn append_turn(&self, session_id: &str, turn: &NewTurn) -> Result<Turn, String> {
        self.db
            .append_turn(session_id, turn)
            .map_err(|e| e.to_string())
    }

    async fn rename_once(&self, session_id: &str, title: &str) -> Result<bool, String> {
        self.db
            .rename_once(session_id, title)
            .map_err(|e| e.to_string())
    }
}

impl ProviderSource for ProviderRegistry {
    fn resolve(&self, model_override: Option<&str>) -> Option<Arc<dyn LlmService>> {
        ProviderRegistry::resolve(self, model_override)
    }
}

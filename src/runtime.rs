//! Runtime for executing chat turns
//!
//! `RuntimeManager` turns an inbound chat request into a running `TurnLoop`:
//! it resolves the provider, loads or creates the session, keeps at most one
//! active turn per session and tracks cancellation handles.

mod accumulator;
mod sink;
pub mod traits;
mod turn_loop;

#[cfg(test)]
pub mod testing;

pub use sink::{ChatEvent, EventSink};
pub use traits::{ConversationStore, DatabaseStorage, ProviderSource};
pub use turn_loop::{TurnLoop, DEFAULT_MAX_ROUNDS};

use crate::system_prompt::build_system_prompt;
use crate::title_generator;
use crate::tools::{ClusterClient, ResourceContext, ToolRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Events buffered between the loop and a slow consumer
const EVENT_BUFFER: usize = 32;

/// Why a turn could not be started. Nothing is persisted in any of these cases.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("No provider available for the requested model")]
    NoProvider,
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session {0} already has a turn in progress")]
    SessionBusy(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Inbound chat request
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Empty or missing creates a new session
    pub session_id: Option<String>,
    pub message: String,
    pub model_override: Option<String>,
    pub context: ResourceContext,
    pub owner: String,
}

/// Handle to a turn running in the background
pub struct ActiveTurn {
    pub session_id: String,
    pub events: mpsc::Receiver<ChatEvent>,
    pub cancel: CancellationToken,
}

type ActiveMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock_active(
    active: &Mutex<HashMap<String, CancellationToken>>,
) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    match active.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Marks a session busy until dropped
struct ActiveGuard {
    active: ActiveMap,
    session_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock_active(&self.active).remove(&self.session_id);
    }
}

/// Manager for all running turns
pub struct RuntimeManager {
    store: Arc<dyn ConversationStore>,
    providers: Arc<dyn ProviderSource>,
    cluster: Option<Arc<ClusterClient>>,
    max_rounds: usize,
    active: ActiveMap,
}

impl RuntimeManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        providers: Arc<dyn ProviderSource>,
        cluster: Option<Arc<ClusterClient>>,
        max_rounds: usize,
    ) -> Self {
        Self {
            store,
            providers,
            cluster,
            max_rounds,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn claim(&self, session_id: &str, cancel: &CancellationToken) -> Result<ActiveGuard, StartError> {
        let mut active = lock_active(&self.active);
        if active.contains_key(session_id) {
            return Err(StartError::SessionBusy(session_id.to_string()));
        }
        active.insert(session_id.to_string(), cancel.clone());
        Ok(ActiveGuard {
            active: self.active.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Start a turn in the background and return its event stream.
    ///
    /// The turn keeps running if the returned receiver is dropped only until
    /// its next event fails to send.
    pub async fn start_turn(&self, request: ChatRequest) -> Result<ActiveTurn, StartError> {
        let provider = self
            .providers
            .resolve(request.model_override.as_deref())
            .ok_or(StartError::NoProvider)?;

        let cancel = CancellationToken::new();
        let existing = request
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());

        let (session_id, history, guard, is_new) = match existing {
            Some(id) => {
                let guard = self.claim(id, &cancel)?;
                let history = self
                    .store
                    .load(id)
                    .await
                    .map_err(StartError::Storage)?
                    .ok_or_else(|| StartError::SessionNotFound(id.to_string()))?;
                (id.to_string(), history, guard, false)
            }
            None => {
                let id = self
                    .store
                    .create(&request.owner)
                    .await
                    .map_err(StartError::Storage)?;
                let guard = self.claim(&id, &cancel)?;
                (id, Vec::new(), guard, true)
            }
        };

        if is_new {
            // Detached: outlives this request and its cancellation
            tokio::spawn(title_generator::generate_and_apply(
                self.store.clone(),
                provider.clone(),
                session_id.clone(),
                request.message.clone(),
            ));
        }

        let tools = ToolRegistry::for_request(&request.context, self.cluster.clone());
        let system_prompt = build_system_prompt(&request.context, &tools.names());
        let (sink, events) = EventSink::channel(EVENT_BUFFER);

        tracing::info!(
            session_id = %session_id,
            new_session = is_new,
            model = %provider.model_id(),
            history = history.len(),
            "Starting turn"
        );

        let turn_loop = TurnLoop::new(self.store.clone(), provider, tools, sink, session_id.clone())
            .with_cancel(cancel.clone())
            .with_resource(request.context)
            .with_system_prompt(system_prompt)
            .with_max_rounds(self.max_rounds)
            .with_claim(guard);
        let message = request.message;

        tokio::spawn(async move {
            turn_loop.run(history, &message).await;
        });

        Ok(ActiveTurn {
            session_id,
            events,
            cancel,
        })
    }

    /// Cancel the active turn of a session. Returns false if none is running.
    pub fn cancel(&self, session_id: &str) -> bool {
        match lock_active(&self.active).get(session_id) {
            Some(token) => {
                tracing::info!(session_id = %session_id, "Cancelling turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        lock_active(&self.active).contains_key(session_id)
    }
}

//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CancelResponse, ChatBody, ErrorResponse, ModelsResponse, SessionListResponse,
    SessionWithTurnsResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::runtime::{ChatRequest, StartError};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Header set by the authenticating proxy in front of the dashboard
const OWNER_HEADER: &str = "x-forwarded-user";
const ANONYMOUS_OWNER: &str = "anonymous";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Chat turn with streamed events
        .route("/api/chat", post(chat))
        // Session history
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        // Model info
        .route("/api/models", get(list_models))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Chat
// ============================================================

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, AppError> {
    if body.message.trim().is_empty() {
        return Err(AppError::BadRequest("Message must not be empty".to_string()));
    }

    let request = ChatRequest {
        session_id: body.session_id,
        message: body.message,
        model_override: body.model_override,
        context: body.context,
        owner: owner_from_headers(&headers),
    };

    let turn = state.runtime.start_turn(request).await.map_err(|e| match e {
        StartError::NoProvider if state.providers.has_provider() => {
            AppError::BadRequest(e.to_string())
        }
        StartError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
        StartError::SessionBusy(_) => AppError::Conflict(e.to_string()),
        StartError::NoProvider | StartError::Storage(_) => AppError::Internal(e.to_string()),
    })?;

    tracing::debug!(session_id = %turn.session_id, "Streaming turn events");
    Ok(sse_stream(turn).into_response())
}

fn owner_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_OWNER)
        .to_string()
}

// ============================================================
// Sessions
// ============================================================

async fn list_sessions(
    State(state): State<AppState>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.db.list_sessions()?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionWithTurnsResponse>, AppError> {
    let session = state.db.get_session(&id)?;
    let turns = state.db.get_turns(&id)?;

    Ok(Json(SessionWithTurnsResponse {
        session,
        turns,
        active: state.runtime.is_active(&id),
    }))
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    // Unknown sessions are a 404, not a silent no-op
    state.db.get_session(&id)?;

    Ok(Json(CancelResponse {
        cancelled: state.runtime.cancel(&id),
    }))
}

// ============================================================
// Model Info
// ============================================================

async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        default: state.providers.default_model_id().to_string(),
        allowed: state.providers.allowed_models().to_vec(),
        available: state.providers.has_provider(),
    })
}

async fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::SessionNotFound(_) => AppError::NotFound(e.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

//! Axum Handlers for the monitoring API
//!
//! Read-only views over the session registry. It uses `utoipa` doc comments to
//! generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use avatar_core::session::SessionId;
use std::sync::Arc;
use tracing::debug;

use crate::{
    models::{ErrorResponse, HealthResponse, SessionSummary},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                debug!(%message, "Lookup missed");
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
        }
    }
}

/// Liveness probe with the current session load.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.registry.len().await,
        max_sessions: state.registry.max_sessions(),
    })
}

/// List all active relay sessions, most recently active first.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of active sessions", body = [SessionSummary])
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionSummary>> {
    let mut sessions: Vec<SessionSummary> = state
        .registry
        .snapshot()
        .await
        .values()
        .map(|session| SessionSummary::from(session.as_ref()))
        .collect();
    sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
    Json(sessions)
}

/// Get a single active session.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionSummary),
        (status = 400, description = "Malformed session id", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Session ID (UUIDv4)")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, ApiError> {
    let id = SessionId::parse(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let session = state
        .registry
        .get(id.as_str())
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session with id '{}' not found", id)))?;
    Ok(Json(SessionSummary::from(session.as_ref())))
}

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use crate::errors::{AppError, AppResult};
use crate::session::SessionSnapshot;
use crate::state::AppState;

/// Public liveness probe
pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "OK" }))
}

/// Live sessions with their state and packet counters
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let sessions = state.sessions.list();
    Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionSnapshot>> {
    state
        .sessions
        .get(&session_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))
}

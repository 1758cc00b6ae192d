use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::api;
use crate::state::AppState;
use std::sync::Arc;

/// Create the API router with protected routes
///
/// Note: Authentication middleware is applied by the caller once state is available
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/sessions", get(api::list_sessions))
        .route("/v1/sessions/{session_id}", get(api::get_session))
        .layer(TraceLayer::new_for_http())
}

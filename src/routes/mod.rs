pub mod api;
pub mod ws;

use std::sync::Arc;

use axum::{Router, middleware, routing::get};

use crate::handlers::api::health_check;
use crate::middleware::{auth_middleware, connection_limit_middleware};
use crate::state::AppState;

/// Every route with its auth and connection-limit layers applied.
///
/// Layer order for WebSocket routes (outer to inner): connection_limit -> auth
/// -> handler. Serve with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the connection limiter can see the peer address.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    let protected_routes = api::create_api_router().layer(middleware::from_fn_with_state(
        state.clone(),
        auth_middleware,
    ));

    let ws_routes = ws::create_ws_router()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ));

    let public_routes = Router::new().route("/", get(health_check));

    public_routes
        .merge(protected_routes)
        .merge(ws_routes)
        .with_state(state)
}

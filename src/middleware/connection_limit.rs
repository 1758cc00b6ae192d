//! Connection limit middleware for WebSocket connections
//!
//! Enforces a global maximum of concurrent WebSocket connections and a per-IP
//! ceiling. Plain HTTP requests pass through untouched.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use duplex_gateway::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/v1/chat/audio", get(audio_chat_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Extension type carrying the client IP to the handler so the slot can be
/// released when the socket closes.
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Releases a reserved connection slot when dropped
pub struct ConnectionGuard {
    state: Arc<AppState>,
    ip: Option<IpAddr>,
}

impl ConnectionGuard {
    pub fn new(state: Arc<AppState>, ip: Option<IpAddr>) -> Self {
        Self { state, ip }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.state.release_connection(ip);
            tracing::debug!(ip = %ip, "Connection slot released");
        }
    }
}

/// Middleware that enforces connection limits for WebSocket upgrades.
///
/// Returns 503 when the global limit is reached and 429 when the caller's IP
/// is at its limit. On success a [`ClientIp`] extension is inserted; the
/// handler is responsible for releasing the slot.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();
    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            request.extensions_mut().insert(ClientIp(client_ip));
            let response = next.run(request).await;
            // a failed upgrade never reaches the socket handler
            if !response.status().is_informational() {
                state.release_connection(client_ip);
            }
            response
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: global limit reached");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::net::Ipv4Addr;

    fn state(max_total: Option<usize>, max_per_ip: u32) -> Arc<AppState> {
        let mut config = ServerConfig::default();
        config.max_websocket_connections = max_total;
        config.max_connections_per_ip = max_per_ip;
        AppState::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_per_ip_limit() {
        let state = state(Some(10), 3);
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 100).into();

        assert_eq!(state.ws_connection_count(), 0);
        for expected in 1..=3 {
            assert!(state.try_acquire_connection(ip).is_ok());
            assert_eq!(state.ip_connection_count(&ip), expected);
        }
        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::PerIpLimitReached)
        );

        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 2);
        assert!(state.try_acquire_connection(ip).is_ok());
    }

    #[tokio::test]
    async fn test_global_limit() {
        let state = state(Some(5), 10);
        let ips: Vec<IpAddr> = (1..=6)
            .map(|i| Ipv4Addr::new(192, 168, 1, i).into())
            .collect();

        for ip in &ips[0..5] {
            assert!(state.try_acquire_connection(*ip).is_ok());
        }
        assert_eq!(
            state.try_acquire_connection(ips[5]),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
        assert_eq!(state.ip_connection_count(&ips[5]), 0);

        state.release_connection(ips[0]);
        assert!(state.try_acquire_connection(ips[5]).is_ok());
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let state = state(None, 10);
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();
        state.try_acquire_connection(ip).unwrap();

        let guard = ConnectionGuard::new(state.clone(), Some(ip));
        assert_eq!(state.ws_connection_count(), 1);
        drop(guard);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }
}

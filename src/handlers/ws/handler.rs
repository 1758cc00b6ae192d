//! Conversation WebSocket handlers
//!
//! One socket is one session. Inbound frames are parsed here and handed to the
//! [`SessionManager`](crate::session::SessionManager); every outbound event
//! goes through a single writer task that serializes it with the configured
//! wire profile, so events reach the client in the order they were produced.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

use crate::auth::Auth;
use crate::middleware::{ClientIp, ConnectionGuard};
use crate::session::{EventSink, PipelineError, SessionEvent, Variant};
use crate::state::AppState;

use super::messages::{ClientMessage, parse_client_message};

/// Outbound event buffer per connection
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum WebSocket frame size (1 MB); packets are at most 50 KiB before
/// base64 encoding
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (1 MB)
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Time the writer gets to flush queued events after the socket loop ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /v1/chat/audio`: audio in, audio out
pub async fn audio_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<Auth>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    upgrade(ws, state, auth, client_ip, Variant::Audio)
}

/// `GET /v1/chat/vlm`: audio plus an image in, audio out
pub async fn vlm_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<Auth>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    upgrade(ws, state, auth, client_ip, Variant::Multimodal)
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    auth: Auth,
    client_ip: Option<Extension<ClientIp>>,
    variant: Variant,
) -> Response {
    info!(auth_id = ?auth.id, variant = %variant, "Conversation WebSocket upgrade requested");
    let ip = client_ip.map(|Extension(ClientIp(ip))| ip);
    let guard = ConnectionGuard::new(state.clone(), ip);

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, variant, guard))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    variant: Variant,
    _guard: ConnectionGuard,
) {
    let (mut sender, mut receiver) = socket.split();
    let (events, mut event_rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
    let profile = state.config.pipeline.wire_profile;

    let writer = AbortOnDropHandle::new(tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = event.encode(variant, profile);
            if let Err(e) = sender.send(Message::Text(text.into())).await {
                debug!("Failed to send WebSocket message: {}", e);
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    }));

    let session_id = state.sessions.open(variant, events.clone()).await;
    let idle_timeout = state.config.pipeline.idle_timeout();

    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            // the client stays quiet while its turn is processed
            Err(_) if state.sessions.is_processing(&session_id) => continue,
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    idle_secs = idle_timeout.as_secs(),
                    "Connection idle, closing"
                );
                events
                    .emit(SessionEvent::error(
                        "idle_timeout",
                        "Connection closed due to inactivity",
                    ))
                    .await;
                break;
            }
            Ok(None) => {
                info!(session_id = %session_id, "Connection closed by client");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(session_id = %session_id, "WebSocket error: {}", e);
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        if !process_message(msg, &state, &session_id, &events).await {
            break;
        }
    }

    state.sessions.close(&session_id);
    drop(events);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(session_id = %session_id, "Writer did not drain in time");
    }
    info!(session_id = %session_id, "Conversation WebSocket terminated");
}

/// Handle one inbound frame. Returns `false` when the connection should close.
async fn process_message(
    msg: Message,
    state: &AppState,
    session_id: &str,
    events: &EventSink,
) -> bool {
    let result = match msg {
        Message::Text(text) => match parse_client_message(&text) {
            Ok(ClientMessage::Packet(packet)) => state.sessions.submit(session_id, packet).await,
            Ok(ClientMessage::End) => state.sessions.finalize(session_id).await,
            Ok(ClientMessage::Cancel) => state.sessions.cancel(session_id).await.map(|_| ()),
            Err(e) => Err(e),
        },
        Message::Binary(data) => {
            debug!(bytes = data.len(), "Binary frame rejected");
            Err(PipelineError::Malformed(
                "Binary frames are not supported, send JSON packets".to_string(),
            ))
        }
        Message::Ping(_) | Message::Pong(_) => Ok(()),
        Message::Close(_) => {
            info!(session_id = %session_id, "WebSocket close received");
            return false;
        }
    };

    if let Err(e) = result {
        if e.is_recoverable() {
            warn!(session_id = %session_id, code = e.code(), error = %e, "Client message rejected");
        } else {
            error!(session_id = %session_id, code = e.code(), error = %e, "Client message failed");
        }
        events
            .emit(SessionEvent::error(e.code(), e.to_string()))
            .await;
    }
    true
}

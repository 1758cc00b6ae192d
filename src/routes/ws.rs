//! Conversation WebSocket routes
//!
//! # Endpoints
//!
//! - `GET /v1/chat/audio` - audio-only conversation
//! - `GET /v1/chat/vlm` - audio plus image conversation
//!
//! # Protocol
//!
//! Clients upload an utterance as numbered JSON packets:
//!
//! ```json
//! {"seq": 1, "total": 3, "data": "<base64 audio>"}
//! ```
//!
//! The multimodal channel tags each packet with `"type": "audio"` or
//! `"type": "image"` and closes the upload with `{"type": "end"}`. Either
//! channel accepts `{"type": "cancel"}`.
//!
//! The server acknowledges every accepted packet with `packet_ack`, then
//! streams `transcription_started`, `chat_started`, `chat_chunk`,
//! `audio_stream` and `chat_tts_complete` events, ending the turn with
//! `audio_complete` (or `vlm_complete`). Failures arrive as
//! `error {message, code}`.

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::ws::{audio_chat_handler, vlm_chat_handler};
use crate::state::AppState;
use std::sync::Arc;

pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/chat/audio", get(audio_chat_handler))
        .route("/v1/chat/vlm", get(vlm_chat_handler))
        .layer(TraceLayer::new_for_http())
}

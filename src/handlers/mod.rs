//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check and session listing
//! - `ws` - Audio and multimodal conversation WebSockets

pub mod api;
pub mod ws;

pub use ws::{audio_chat_handler, vlm_chat_handler};

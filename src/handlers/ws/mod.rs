//! Conversation WebSocket channels
//!
//! - [`messages`]: client frame parsing
//! - [`handler`]: socket lifecycle and the ordered event writer

pub mod handler;
pub mod messages;

pub use handler::{audio_chat_handler, vlm_chat_handler};
pub use messages::{ClientMessage, parse_client_message};

//! Realtime text-to-speech over WebSocket (server-commit mode, PCM output).

pub mod client;
pub mod config;
pub mod messages;

pub use client::RealtimeTtsClient;
pub use config::RealtimeTtsConfig;

//! OpenAI-compatible `chat/completions` streaming client.

pub mod client;
pub mod config;
pub mod messages;
pub mod sse;

pub use client::OpenAICompatChat;
pub use config::ChatClientConfig;

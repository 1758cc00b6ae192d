//! Speech-to-text collaborator.
//!
//! The pipeline only needs one call: turn a finished utterance into text.

pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use openai::{OpenAICompatTranscriber, TranscriptionConfig};

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Converts a complete audio buffer into text.
///
/// An empty string is a valid result (silence); it is not an error.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Bytes) -> Result<String, TranscriptionError>;
}

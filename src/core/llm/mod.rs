//! Streaming chat generation collaborator.
//!
//! [`ChatStreamer::stream_chat`] resolves once the provider has accepted the
//! request; text deltas then arrive on the returned stream in provider order.

pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

pub use openai::{ChatClientConfig, OpenAICompatChat};

/// Default voice-assistant system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a voice assistant. Be friendly, patient and \
professional. Keep answers short and clear, since they will be spoken aloud. Reply in the \
language the user speaks (Chinese or English). If you are not sure about something, say so.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Image attached to a multimodal turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Publicly reachable URL of the uploaded image
    Url(String),
    /// Raw image bytes, sent as a `data:` URL
    Inline { mime_type: String, data: Bytes },
}

impl ImageRef {
    /// URL form accepted by the `image_url` content part
    pub fn to_url(&self) -> String {
        match self {
            ImageRef::Url(url) => url.clone(),
            ImageRef::Inline { mime_type, data } => {
                format!("data:{mime_type};base64,{}", STANDARD.encode(data))
            }
        }
    }
}

/// Conversation context for one turn
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub system_prompt: String,
    pub user_message: String,
    pub image: Option<ImageRef>,
}

impl ChatContext {
    pub fn text(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageRef) -> Self {
        self.image = Some(image);
        self
    }
}

pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

#[async_trait]
pub trait ChatStreamer: Send + Sync {
    async fn stream_chat(&self, context: ChatContext) -> Result<TextDeltaStream, ChatError>;
}

/// Best-effort MIME type from an image's magic bytes
pub fn sniff_image_mime(data: &[u8]) -> &'static str {
    match data {
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_image_data_url() {
        let image = ImageRef::Inline {
            mime_type: "image/png".to_string(),
            data: Bytes::from_static(b"abc"),
        };
        assert_eq!(image.to_url(), "data:image/png;base64,YWJj");
        assert_eq!(
            ImageRef::Url("https://cdn/x.png".into()).to_url(),
            "https://cdn/x.png"
        );
    }

    #[test]
    fn test_sniff_image_mime() {
        assert_eq!(sniff_image_mime(&[0x89, b'P', b'N', b'G', 0x0D]), "image/png");
        assert_eq!(sniff_image_mime(&[0xFF, 0xD8, 0xFF, 0xE0]), "image/jpeg");
        assert_eq!(sniff_image_mime(b"RIFF\0\0\0\0WEBPVP8"), "image/webp");
        assert_eq!(sniff_image_mime(b"??"), "application/octet-stream");
    }
}

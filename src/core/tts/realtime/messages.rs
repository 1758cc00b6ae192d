//! Realtime TTS WebSocket events.
//!
//! Client events (sent to server):
//! - session.update - configure voice and PCM output
//! - input_text_buffer.append - append text to synthesize
//! - session.finish - no more text
//!
//! Server events (received from server):
//! - session.created / session.updated
//! - response.audio.delta - base64 PCM chunk
//! - response.audio.done / response.done
//! - session.finished - all audio delivered
//! - error

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// `session.update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub mode: String,
    pub voice: String,
    pub response_format: String,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },

    #[serde(rename = "input_text_buffer.append")]
    AppendText { text: String },

    #[serde(rename = "session.finish")]
    SessionFinish,
}

/// Client event stamped with its `event_id`
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEvent {
    pub event_id: String,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiError {
    pub message: Option<String>,
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub error_type: Option<String>,
}

impl ApiError {
    pub fn describe(&self) -> String {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => format!("{code}: {message}"),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown provider error".to_string(),
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        let code = self.code.as_deref().unwrap_or_default().to_ascii_lowercase();
        ["auth", "apikey", "access"]
            .iter()
            .any(|needle| code.contains(needle))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "session.finished")]
    SessionFinished,

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: ApiError,
    },

    #[serde(other)]
    Unknown,
}

/// Decode the PCM carried by `response.audio.delta`
pub fn decode_audio_delta(delta: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64_STANDARD.decode(delta).map(Bytes::from)
}

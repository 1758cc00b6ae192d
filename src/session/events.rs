//! Client-facing session events and their wire encodings.
//!
//! Pipeline stages produce [`SessionEvent`] values only. The connection's
//! writer task turns them into JSON with [`SessionEvent::encode`], choosing the
//! event name from the conversation [`Variant`] and the envelope from the
//! configured [`WireProfile`].

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;

use crate::core::reassembly::Channel;

/// Conversation flavour of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Audio in, audio out
    Audio,
    /// Audio plus an image in, audio out
    #[serde(rename = "vlm")]
    Multimodal,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Audio => "audio",
            Variant::Multimodal => "vlm",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON framing of outbound events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireProfile {
    /// `{"<event_name>": {payload}}`
    #[default]
    Keyed,
    /// `{"event_type": "<event_name>", "data": {payload}}`
    Envelope,
}

impl WireProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireProfile::Keyed => "keyed",
            WireProfile::Envelope => "envelope",
        }
    }
}

impl FromStr for WireProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyed" => Ok(WireProfile::Keyed),
            "envelope" => Ok(WireProfile::Envelope),
            other => Err(format!(
                "Unknown wire profile '{other}', expected 'keyed' or 'envelope'"
            )),
        }
    }
}

/// End-of-turn summary (`audio_complete` / `vlm_complete`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TurnSummary {
    pub message: String,
    pub session_id: String,
    pub turn: u32,
    pub packets: u64,
    pub packets_declared: u64,
    pub audio_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<usize>,
    /// Seconds from the turn's first packet to this event
    pub duration: f64,
    pub oss_uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oss_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub transcription: String,
    pub assistant_response: String,
    pub generation_skipped: bool,
    pub segments_count: u32,
    pub audio_chunks: u64,
    pub dropped_frames: u64,
    pub db_saved: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        session_id: String,
    },
    PacketAck {
        channel: Channel,
        seq: u32,
        received: u32,
        total: u32,
        duplicate: bool,
    },
    TranscriptionStarted {
        oss_url: Option<String>,
        image_url: Option<String>,
    },
    ChatStarted {
        user_message: String,
        image_url: Option<String>,
    },
    /// Transcription was empty; generation and synthesis are not run
    ChatSkipped,
    TtsStarted,
    ChatChunk {
        chunk: String,
        full_response: String,
    },
    AudioData {
        seq: u64,
        format: &'static str,
        data: Bytes,
    },
    AudioFinished {
        chunks: u64,
    },
    ChatTtsComplete {
        transcription: String,
        assistant_response: String,
        tts_success: bool,
        segments_count: u32,
        total_segments: u32,
        dropped_frames: u64,
        db_saved: bool,
    },
    Summary(Box<TurnSummary>),
    Error {
        code: &'static str,
        message: String,
    },
}

impl SessionEvent {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        SessionEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Wire name of the event for a conversation variant
    pub fn name(&self, variant: Variant) -> &'static str {
        let vlm = variant == Variant::Multimodal;
        match self {
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::PacketAck { .. } => "packet_ack",
            SessionEvent::TranscriptionStarted { .. } => "transcription_started",
            SessionEvent::ChatStarted { .. } if vlm => "vlm_chat_started",
            SessionEvent::ChatStarted { .. } => "chat_started",
            SessionEvent::ChatSkipped => "chat_skipped",
            SessionEvent::TtsStarted => "tts_started",
            SessionEvent::ChatChunk { .. } if vlm => "vlm_chat_chunk",
            SessionEvent::ChatChunk { .. } => "chat_chunk",
            SessionEvent::AudioData { .. } | SessionEvent::AudioFinished { .. } => "audio_stream",
            SessionEvent::ChatTtsComplete { .. } if vlm => "vlm_chat_tts_complete",
            SessionEvent::ChatTtsComplete { .. } => "chat_tts_complete",
            SessionEvent::Summary(_) if vlm => "vlm_complete",
            SessionEvent::Summary(_) => "audio_complete",
            SessionEvent::Error { .. } => "error",
        }
    }

    pub fn payload(&self, variant: Variant) -> Value {
        match self {
            SessionEvent::Connected { session_id } => json!({
                "message": format!("{} connection established", variant.as_str()),
                "session_id": session_id,
            }),
            SessionEvent::PacketAck {
                channel,
                seq,
                received,
                total,
                duplicate,
            } => {
                let mut ack = json!({
                    "seq": seq,
                    "received": received,
                    "total": total,
                });
                if variant == Variant::Multimodal {
                    ack["type"] = json!(channel.as_str());
                }
                if *duplicate {
                    ack["duplicate"] = json!(true);
                }
                ack
            }
            SessionEvent::TranscriptionStarted { oss_url, image_url } => {
                let mut payload = Map::new();
                payload.insert("message".into(), json!("Transcription started"));
                insert_opt(&mut payload, "oss_url", oss_url);
                insert_opt(&mut payload, "image_url", image_url);
                Value::Object(payload)
            }
            SessionEvent::ChatStarted {
                user_message,
                image_url,
            } => {
                let mut payload = Map::new();
                payload.insert("message".into(), json!("Generating response"));
                payload.insert("user_message".into(), json!(user_message));
                insert_opt(&mut payload, "image_url", image_url);
                Value::Object(payload)
            }
            SessionEvent::ChatSkipped => json!({
                "message": "No speech recognized, skipping generation",
                "transcription": "",
            }),
            SessionEvent::TtsStarted => json!({ "message": "Speech synthesis started" }),
            SessionEvent::ChatChunk {
                chunk,
                full_response,
            } => json!({
                "chunk": chunk,
                "full_response": full_response,
            }),
            SessionEvent::AudioData { seq, format, data } => json!({
                "event": "data",
                "seq": seq,
                "format": format,
                "data": STANDARD.encode(data),
            }),
            SessionEvent::AudioFinished { chunks } => json!({
                "event": "finished",
                "chunks": chunks,
            }),
            SessionEvent::ChatTtsComplete {
                transcription,
                assistant_response,
                tts_success,
                segments_count,
                total_segments,
                dropped_frames,
                db_saved,
            } => json!({
                "message": "Response generation and speech synthesis complete",
                "transcription": transcription,
                "assistant_response": assistant_response,
                "tts_success": tts_success,
                "segments_count": segments_count,
                "total_segments": total_segments,
                "dropped_frames": dropped_frames,
                "db_saved": db_saved,
            }),
            SessionEvent::Summary(summary) => {
                serde_json::to_value(summary.as_ref()).unwrap_or_else(|_| json!({}))
            }
            SessionEvent::Error { code, message } => json!({
                "message": message,
                "code": code,
            }),
        }
    }

    /// Serialize for the wire
    pub fn encode(&self, variant: Variant, profile: WireProfile) -> String {
        let name = self.name(variant);
        let payload = self.payload(variant);
        let framed = match profile {
            WireProfile::Keyed => {
                let mut map = Map::with_capacity(1);
                map.insert(name.to_string(), payload);
                Value::Object(map)
            }
            WireProfile::Envelope => json!({
                "event_type": name,
                "data": payload,
            }),
        };
        framed.to_string()
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        map.insert(key.to_string(), json!(value));
    }
}

/// Ordered outbound event channel of one connection
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an event. Returns `false` once the connection writer is gone.
    pub async fn emit(&self, event: SessionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

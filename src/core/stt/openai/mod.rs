//! OpenAI-compatible transcription (`POST {base}/audio/transcriptions`).
//!
//! Works with OpenAI Whisper and with self-hosted servers exposing the same
//! multipart contract (faster-whisper, vLLM, SenseVoice gateways).
//!
//! - [`config`]: endpoint, model and upload naming
//! - [`messages`]: response body
//! - [`client`]: the [`OpenAICompatTranscriber`]

pub mod client;
pub mod config;
pub mod messages;

pub use client::OpenAICompatTranscriber;
pub use config::TranscriptionConfig;

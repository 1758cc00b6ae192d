//! Upload and completion-record persistence.
//!
//! The pipeline only depends on the two narrow traits here. [`ObjectStorage`]
//! implements both on top of `object_store` (memory, local filesystem or S3).

pub mod object;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use object::{ObjectStorage, ObjectStorageConfig, StorageBackend};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage configuration error: {0}")]
    Configuration(String),
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::AlreadyExists { path, .. } => StorageError::AlreadyExists(path),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Uploads reassembled input and reports where it landed
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError>;
}

/// Write-once sink for finished turns
#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn persist(&self, record: &CompletionRecord) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Success,
    /// Transcription came back empty and generation was skipped
    Skipped,
    Failed,
}

/// Summary of one conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub session_id: String,
    pub turn: u32,
    pub variant: String,
    pub outcome: TurnOutcome,
    pub transcript: String,
    pub response: String,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
    pub tts_success: bool,
    pub segments_count: u32,
    pub audio_chunks: u64,
    pub dropped_frames: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// RFC 3339
    pub started_at: String,
    pub transcription_ms: Option<u64>,
    pub generation_ms: Option<u64>,
    pub total_ms: u64,
}

impl CompletionRecord {
    pub fn is_success(&self) -> bool {
        self.outcome != TurnOutcome::Failed
    }
}

/// `{prefix}/{session_id}/{turn}/{name}`
pub fn input_key(prefix: &str, session_id: &str, turn: u32, name: &str) -> String {
    join_key(prefix, &format!("{session_id}/{turn}/{name}"))
}

/// `{prefix}/records/{session_id}-{turn}.json`
pub fn record_key(prefix: &str, session_id: &str, turn: u32) -> String {
    join_key(prefix, &format!("records/{session_id}-{turn}.json"))
}

fn join_key(prefix: &str, rest: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{prefix}/{rest}")
    }
}

/// Current UTC time formatted as RFC 3339
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys() {
        assert_eq!(input_key("duplex/", "abc", 2, "audio.bin"), "duplex/abc/2/audio.bin");
        assert_eq!(input_key("", "abc", 1, "image.bin"), "abc/1/image.bin");
        assert_eq!(record_key("/duplex", "abc", 3), "duplex/records/abc-3.json");
    }

    #[test]
    fn test_now_rfc3339() {
        let now = now_rfc3339();
        assert!(now.contains('T'));
        assert!(time::OffsetDateTime::parse(
            &now,
            &time::format_description::well_known::Rfc3339
        )
        .is_ok());
    }

    #[test]
    fn test_outcome_serialization() {
        assert_eq!(
            serde_json::to_string(&TurnOutcome::Skipped).unwrap(),
            "\"skipped\""
        );
    }
}

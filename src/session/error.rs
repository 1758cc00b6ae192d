use thiserror::Error;

use crate::core::llm::ChatError;
use crate::core::reassembly::ReassemblyError;
use crate::core::storage::StorageError;
use crate::core::stt::TranscriptionError;
use crate::core::transcode::TranscodeError;
use crate::core::tts::SynthesisError;

use super::state::InvalidTransition;

/// Everything that can end a turn or reject a client message
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error("A turn is already being processed")]
    Busy,

    #[error("Upload did not complete within {0} seconds")]
    UploadTimeout(u64),

    #[error("Upload failed: {0}")]
    Upload(StorageError),

    #[error("Transcription failed: {0}")]
    Transcription(#[from] TranscriptionError),

    #[error("Generation failed: {0}")]
    Generation(#[from] ChatError),

    #[error("Generation produced no text")]
    EmptyGeneration,

    #[error("Synthesis failed: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Transcoding failed: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Saving completion record failed: {0}")]
    Persistence(StorageError),

    #[error("No response from {stage} within {seconds} seconds")]
    FirstResponseTimeout { stage: &'static str, seconds: u64 },

    #[error("Turn did not finish within {0} seconds")]
    TurnTimeout(u64),

    #[error("Turn cancelled by client")]
    Cancelled,

    #[error("Client disconnected")]
    Disconnected,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl PipelineError {
    /// Machine-readable code of the client `error` event
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Reassembly(e) => e.code(),
            PipelineError::Busy => "session_busy",
            PipelineError::UploadTimeout(_) => "upload_timeout",
            PipelineError::Upload(_) | PipelineError::Persistence(_) => "storage_failed",
            PipelineError::Transcription(_) => "transcription_failed",
            PipelineError::Generation(_) | PipelineError::EmptyGeneration => "generation_failed",
            PipelineError::Synthesis(_) | PipelineError::Transcode(_) => "synthesis_failed",
            PipelineError::FirstResponseTimeout { .. } | PipelineError::TurnTimeout(_) => {
                "timeout"
            }
            PipelineError::Cancelled => "cancelled",
            PipelineError::Disconnected => "disconnected",
            PipelineError::Malformed(_) => "malformed_packet",
            PipelineError::InvalidTransition(_) => "internal",
        }
    }

    /// Rejections that leave the turn running
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Reassembly(_) | PipelineError::Busy | PipelineError::Malformed(_)
        )
    }
}

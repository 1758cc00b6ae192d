use std::time::Duration;

/// Default transcription model
pub const DEFAULT_TRANSCRIPTION_MODEL: &str = "whisper-1";

/// Settings for [`super::OpenAICompatTranscriber`]
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// ISO-639-1 hint; omitted from the request when `None`
    pub language: Option<String>,
    /// File name sent with the multipart upload, used by servers for format sniffing
    pub file_name: String,
    pub mime_type: String,
    pub request_timeout: Duration,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: DEFAULT_TRANSCRIPTION_MODEL.to_string(),
            language: None,
            file_name: "audio.wav".to_string(),
            mime_type: "audio/wav".to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl TranscriptionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err("Transcription base URL must not be empty".to_string());
        }
        if self.model.trim().is_empty() {
            return Err("Transcription model must not be empty".to_string());
        }
        Ok(())
    }

    pub fn api_url(&self) -> String {
        crate::core::openai::endpoint(&self.base_url, "audio/transcriptions")
    }
}

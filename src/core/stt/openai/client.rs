//! Multipart transcription client.
//!
//! The HTTP client is built once and reused across turns (connection pooling).
//! Retries are not attempted here; a failed call fails the turn.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use tracing::{debug, error};

use super::config::TranscriptionConfig;
use super::messages::TranscriptionResponse;
use crate::core::openai::describe_error;
use crate::core::stt::{Transcriber, TranscriptionError};

pub struct OpenAICompatTranscriber {
    http_client: Client,
    config: TranscriptionConfig,
}

impl OpenAICompatTranscriber {
    pub fn new(config: TranscriptionConfig) -> Result<Self, TranscriptionError> {
        config
            .validate()
            .map_err(TranscriptionError::ConfigurationError)?;

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| {
                TranscriptionError::ConfigurationError(format!(
                    "Failed to create HTTP client: {e}"
                ))
            })?;

        Ok(Self {
            http_client,
            config,
        })
    }

    pub fn config(&self) -> &TranscriptionConfig {
        &self.config
    }

    fn build_form(&self, audio: Bytes) -> Result<Form, TranscriptionError> {
        let file_part = Part::bytes(audio.to_vec())
            .file_name(self.config.file_name.clone())
            .mime_str(&self.config.mime_type)
            .map_err(|e| {
                TranscriptionError::ConfigurationError(format!("Invalid MIME type: {e}"))
            })?;

        let mut form = Form::new()
            .part("file", file_part)
            .text("model", self.config.model.clone())
            .text("response_format", "json");

        if let Some(ref language) = self.config.language {
            form = form.text("language", language.clone());
        }
        Ok(form)
    }
}

#[async_trait]
impl Transcriber for OpenAICompatTranscriber {
    async fn transcribe(&self, audio: Bytes) -> Result<String, TranscriptionError> {
        let audio_len = audio.len();
        let form = self.build_form(audio)?;

        let mut request = self.http_client.post(self.config.api_url()).multipart(form);
        if let Some(ref key) = self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::NetworkError(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            TranscriptionError::NetworkError(format!("Failed to read response: {e}"))
        })?;

        if !status.is_success() {
            let message = describe_error(status, &body);
            error!(status = %status, "Transcription request failed");
            return Err(match status.as_u16() {
                401 | 403 => TranscriptionError::AuthenticationFailed(message),
                _ => TranscriptionError::ProviderError(message),
            });
        }

        let parsed: TranscriptionResponse = serde_json::from_str(&body).map_err(|e| {
            TranscriptionError::InvalidResponse(format!("Failed to parse response: {e}"))
        })?;

        debug!(
            audio_bytes = audio_len,
            text_len = parsed.text.len(),
            language = ?parsed.language,
            "Transcription completed"
        );
        Ok(parsed.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = TranscriptionConfig {
            base_url: String::new(),
            ..Default::default()
        };
        assert!(matches!(
            OpenAICompatTranscriber::new(config),
            Err(TranscriptionError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_bad_mime_type_rejected() {
        let transcriber = OpenAICompatTranscriber::new(TranscriptionConfig {
            mime_type: "not a mime".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(transcriber.build_form(Bytes::from_static(b"RIFF")).is_err());
    }
}

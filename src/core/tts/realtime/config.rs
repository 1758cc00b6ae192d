use std::time::Duration;

use super::messages::SessionSettings;
use crate::core::transcode::transcoder::DEFAULT_SAMPLE_RATE;

/// Default voice
pub const DEFAULT_VOICE: &str = "Cherry";

/// Commit mode in which the server decides when to synthesize buffered text
pub const SERVER_COMMIT_MODE: &str = "server_commit";

#[derive(Debug, Clone)]
pub struct RealtimeTtsConfig {
    /// WebSocket endpoint, e.g. `wss://host/api-ws/v1/realtime`
    pub url: String,
    pub api_key: Option<String>,
    /// Appended as `?model=` when set
    pub model: Option<String>,
    pub voice: String,
    pub sample_rate: u32,
    pub connect_timeout: Duration,
}

impl Default for RealtimeTtsConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765/realtime".to_string(),
            api_key: None,
            model: None,
            voice: DEFAULT_VOICE.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl RealtimeTtsConfig {
    pub fn validate(&self) -> Result<(), String> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| format!("Invalid synthesis URL '{}': {e}", self.url))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!(
                "Synthesis URL must use ws:// or wss://, got '{}'",
                url.scheme()
            ));
        }
        if self.voice.trim().is_empty() {
            return Err("Synthesis voice must not be empty".to_string());
        }
        if self.sample_rate == 0 {
            return Err("Synthesis sample rate must be positive".to_string());
        }
        Ok(())
    }

    /// Endpoint with the model query parameter applied
    pub fn ws_url(&self) -> Result<String, String> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| format!("Invalid synthesis URL '{}': {e}", self.url))?;
        if let Some(ref model) = self.model {
            url.query_pairs_mut().append_pair("model", model);
        }
        Ok(url.to_string())
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            mode: SERVER_COMMIT_MODE.to_string(),
            voice: self.voice.clone(),
            response_format: "pcm".to_string(),
            sample_rate: self.sample_rate,
        }
    }
}

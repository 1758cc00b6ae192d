use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    /// API root, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub api_key: Option<String>,
    /// Model for text-only turns
    pub model: String,
    /// Model for turns carrying an image
    pub vlm_model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Connect timeout; the body stream itself is bounded by the turn deadline
    pub connect_timeout: Duration,
}

impl Default for ChatClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            vlm_model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ChatClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.trim().is_empty() {
            return Err("Chat base URL must not be empty".to_string());
        }
        if self.model.trim().is_empty() || self.vlm_model.trim().is_empty() {
            return Err("Chat model names must not be empty".to_string());
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(format!("Chat temperature {t} outside [0, 2]"));
        }
        Ok(())
    }

    pub fn api_url(&self) -> String {
        crate::core::openai::endpoint(&self.base_url, "chat/completions")
    }
}

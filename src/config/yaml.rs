use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present
/// here override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     enabled: true
///     cert_path: "/etc/duplex/cert.pem"
///     key_path: "/etc/duplex/key.pem"
///
/// auth:
///   required: true
///   api_secrets:
///     - id: "client-a"
///       secret: "your-api-secret"
///
/// security:
///   cors_allowed_origins: "https://example.com"
///   rate_limit_requests_per_second: 60
///   max_websocket_connections: 1000
///
/// providers:
///   transcription_base_url: "https://api.openai.com/v1"
///   transcription_api_key: "sk-..."
///   chat_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1"
///   chat_model: "qwen-plus"
///   vlm_model: "qwen-vl-max"
///   tts_url: "wss://dashscope.aliyuncs.com/api-ws/v1/realtime"
///   tts_model: "qwen-tts-realtime"
///   tts_voice: "Cherry"
///
/// pipeline:
///   queue_capacity: 64
///   overflow_policy: "block"
///   transcode_workers: 4
///   encoder: "wav"
///   wire_profile: "keyed"
///
/// storage:
///   backend: "s3"
///   s3_bucket: "duplex-turns"
///   prefix: "prod"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub auth: Option<AuthYaml>,
    pub security: Option<SecurityYaml>,
    pub providers: Option<ProvidersYaml>,
    pub pipeline: Option<PipelineYaml>,
    pub storage: Option<StorageYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Authentication configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub required: Option<bool>,
    /// Preferred multi-secret form. If non-empty, it takes precedence over api_secret.
    #[serde(default)]
    pub api_secrets: Vec<AuthApiSecretYaml>,
    /// Single-secret alias. Ignored when api_secrets is non-empty.
    pub api_secret: Option<String>,
}

/// API secret authentication entry in YAML
#[derive(Debug, Clone, Deserialize)]
pub struct AuthApiSecretYaml {
    pub id: String,
    pub secret: String,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

/// Collaborator endpoints from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersYaml {
    pub transcription_base_url: Option<String>,
    pub transcription_api_key: Option<String>,
    pub transcription_model: Option<String>,
    pub transcription_language: Option<String>,
    pub chat_base_url: Option<String>,
    pub chat_api_key: Option<String>,
    pub chat_model: Option<String>,
    pub vlm_model: Option<String>,
    pub chat_temperature: Option<f32>,
    pub chat_max_tokens: Option<u32>,
    pub tts_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    pub tts_sample_rate: Option<u32>,
}

/// Pipeline tuning from YAML
///
/// Enumerated values (`overflow_policy`, `encoder`, `wire_profile`) are kept
/// as strings here and parsed during the merge so errors name the field.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineYaml {
    pub queue_capacity: Option<usize>,
    pub overflow_policy: Option<String>,
    pub transcode_workers: Option<usize>,
    pub encoder: Option<String>,
    pub segment_duration_ms: Option<u32>,
    pub audio_packet_max_bytes: Option<usize>,
    pub vlm_packet_max_bytes: Option<usize>,
    pub max_packets_per_channel: Option<u32>,
    pub upload_timeout_seconds: Option<u64>,
    pub first_response_timeout_seconds: Option<u64>,
    pub audio_turn_timeout_seconds: Option<u64>,
    pub vlm_turn_timeout_seconds: Option<u64>,
    pub idle_timeout_seconds: Option<u64>,
    pub sentence_max_chars: Option<usize>,
    pub system_prompt: Option<String>,
    pub wire_profile: Option<String>,
    pub persist_failures: Option<bool>,
}

/// Storage backend from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageYaml {
    /// `none`, `memory`, `local` or `s3`
    pub backend: Option<String>,
    pub local_path: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub prefix: Option<String>,
    pub public_base_url: Option<String>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8080

auth:
  required: true
  api_secrets:
    - id: "client-a"
      secret: "auth-secret"

providers:
  chat_model: "qwen-plus"
  tts_url: "wss://tts.example.com/realtime"
  tts_sample_rate: 16000

pipeline:
  queue_capacity: 32
  overflow_policy: "drop"
  sentence_max_chars: 80

storage:
  backend: "s3"
  s3_bucket: "turns"
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            config.server.as_ref().unwrap().host,
            Some("127.0.0.1".to_string())
        );
        let auth = config.auth.as_ref().unwrap();
        assert_eq!(auth.required, Some(true));
        assert_eq!(auth.api_secrets[0].id, "client-a");

        let providers = config.providers.as_ref().unwrap();
        assert_eq!(providers.chat_model.as_deref(), Some("qwen-plus"));
        assert_eq!(providers.tts_sample_rate, Some(16000));

        let pipeline = config.pipeline.as_ref().unwrap();
        assert_eq!(pipeline.queue_capacity, Some(32));
        assert_eq!(pipeline.overflow_policy.as_deref(), Some("drop"));
        assert_eq!(pipeline.sentence_max_chars, Some(80));
        assert!(pipeline.encoder.is_none());

        assert_eq!(
            config.storage.as_ref().unwrap().s3_bucket.as_deref(),
            Some("turns")
        );
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("").unwrap();

        assert!(config.server.is_none());
        assert!(config.providers.is_none());
        assert!(config.pipeline.is_none());
        assert!(config.storage.is_none());
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");

        fs::write(&config_path, "invalid: yaml: content:").unwrap();

        let result = YamlConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}

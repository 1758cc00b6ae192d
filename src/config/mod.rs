//! Configuration module for the duplex gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Applying YAML overrides on top of the environment
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use duplex_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable base
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod env;
mod merge;
mod validation;
mod yaml;

use crate::core::llm::{ChatClientConfig, DEFAULT_SYSTEM_PROMPT};
use crate::core::reassembly::{
    AUDIO_PACKET_MAX_BYTES, DEFAULT_MAX_TOTAL_PACKETS, MULTIMODAL_PACKET_MAX_BYTES,
};
use crate::core::storage::{ObjectStorageConfig, StorageBackend};
use crate::core::stt::TranscriptionConfig;
use crate::core::transcode::{
    DEFAULT_QUEUE_CAPACITY, EncoderKind, OverflowPolicy, TranscoderConfig,
    transcoder::{DEFAULT_SAMPLE_RATE, DEFAULT_SEGMENT_DURATION_MS},
};
use crate::core::tts::RealtimeTtsConfig;
use crate::core::tts::realtime::config::DEFAULT_VOICE;
use crate::session::WireProfile;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// API secret authentication entry with a client identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthApiSecret {
    pub id: String,
    pub secret: String,
}

/// Endpoints and credentials of the three streaming collaborators
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub transcription_base_url: String,
    pub transcription_api_key: Option<String>,
    pub transcription_model: String,
    pub transcription_language: Option<String>,

    pub chat_base_url: String,
    pub chat_api_key: Option<String>,
    pub chat_model: String,
    /// Model used for image turns; falls back to `chat_model`
    pub vlm_model: Option<String>,
    pub chat_temperature: Option<f32>,
    pub chat_max_tokens: Option<u32>,

    /// Realtime synthesis WebSocket endpoint
    pub tts_url: String,
    pub tts_api_key: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: String,
    pub tts_sample_rate: u32,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            transcription_base_url: "https://api.openai.com/v1".to_string(),
            transcription_api_key: None,
            transcription_model: "whisper-1".to_string(),
            transcription_language: None,
            chat_base_url: "https://api.openai.com/v1".to_string(),
            chat_api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            vlm_model: None,
            chat_temperature: None,
            chat_max_tokens: None,
            tts_url: "ws://localhost:8765/realtime".to_string(),
            tts_api_key: None,
            tts_model: None,
            tts_voice: DEFAULT_VOICE.to_string(),
            tts_sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl ProvidersConfig {
    pub fn transcription(&self) -> TranscriptionConfig {
        TranscriptionConfig {
            base_url: self.transcription_base_url.clone(),
            api_key: self.transcription_api_key.clone(),
            model: self.transcription_model.clone(),
            language: self.transcription_language.clone(),
            ..Default::default()
        }
    }

    pub fn chat(&self) -> ChatClientConfig {
        ChatClientConfig {
            base_url: self.chat_base_url.clone(),
            api_key: self.chat_api_key.clone(),
            model: self.chat_model.clone(),
            vlm_model: self.vlm_model.clone().unwrap_or_else(|| self.chat_model.clone()),
            temperature: self.chat_temperature,
            max_tokens: self.chat_max_tokens,
            ..Default::default()
        }
    }

    pub fn synthesis(&self) -> RealtimeTtsConfig {
        RealtimeTtsConfig {
            url: self.tts_url.clone(),
            api_key: self.tts_api_key.clone(),
            model: self.tts_model.clone(),
            voice: self.tts_voice.clone(),
            sample_rate: self.tts_sample_rate,
            ..Default::default()
        }
    }
}

/// Tuning of the per-session streaming pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Frames buffered between synthesis and the transcoder, per session
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Process-wide encoding permits
    pub transcode_workers: usize,
    pub encoder: EncoderKind,
    pub segment_duration_ms: u32,
    pub audio_packet_max_bytes: usize,
    pub vlm_packet_max_bytes: usize,
    /// Ceiling on a channel's declared packet total
    pub max_packets_per_channel: u32,
    /// Maximum time between a channel's first packet and completion
    pub upload_timeout_seconds: u64,
    /// Maximum wait for a collaborator's first response
    pub first_response_timeout_seconds: u64,
    pub audio_turn_timeout_seconds: u64,
    pub vlm_turn_timeout_seconds: u64,
    /// Connections without any inbound frame for this long are closed
    pub idle_timeout_seconds: u64,
    pub sentence_max_chars: usize,
    pub system_prompt: String,
    pub wire_profile: WireProfile,
    /// Persist a record with failure flags when a turn errors
    pub persist_failures: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow_policy: OverflowPolicy::Block,
            transcode_workers: 4,
            encoder: EncoderKind::Wav,
            segment_duration_ms: DEFAULT_SEGMENT_DURATION_MS,
            audio_packet_max_bytes: AUDIO_PACKET_MAX_BYTES,
            vlm_packet_max_bytes: MULTIMODAL_PACKET_MAX_BYTES,
            max_packets_per_channel: DEFAULT_MAX_TOTAL_PACKETS,
            upload_timeout_seconds: 30,
            first_response_timeout_seconds: 30,
            audio_turn_timeout_seconds: 120,
            vlm_turn_timeout_seconds: 180,
            idle_timeout_seconds: 300,
            sentence_max_chars: 50,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            wire_profile: WireProfile::Keyed,
            persist_failures: true,
        }
    }
}

impl PipelineConfig {
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_seconds)
    }

    pub fn first_response_timeout(&self) -> Duration {
        Duration::from_secs(self.first_response_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn transcoder(&self, sample_rate: u32) -> TranscoderConfig {
        TranscoderConfig {
            sample_rate,
            segment_duration_ms: self.segment_duration_ms,
            encoder: self.encoder,
        }
    }
}

/// Where uploads and completion records go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    /// Uploads skipped, records not persisted
    #[default]
    Disabled,
    Memory,
    Local,
    S3,
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "disabled" => Ok(StorageKind::Disabled),
            "memory" => Ok(StorageKind::Memory),
            "local" | "filesystem" => Ok(StorageKind::Local),
            "s3" => Ok(StorageKind::S3),
            other => Err(format!(
                "Unknown storage backend '{other}', expected 'none', 'memory', 'local' or 's3'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageKind,
    pub local_path: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Key prefix for uploads and records
    pub prefix: String,
    pub public_base_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Disabled,
            local_path: None,
            s3_bucket: None,
            s3_region: None,
            s3_endpoint: None,
            s3_access_key: None,
            s3_secret_key: None,
            prefix: "duplex".to_string(),
            public_base_url: None,
        }
    }
}

impl StorageConfig {
    /// Backend settings, or `None` when storage is disabled
    pub fn object_storage(&self) -> Result<Option<ObjectStorageConfig>, String> {
        let backend = match self.backend {
            StorageKind::Disabled => return Ok(None),
            StorageKind::Memory => StorageBackend::Memory,
            StorageKind::Local => StorageBackend::Local {
                root: self
                    .local_path
                    .clone()
                    .ok_or("Local storage requires a path")?,
            },
            StorageKind::S3 => StorageBackend::S3 {
                bucket: self.s3_bucket.clone().ok_or("S3 storage requires a bucket")?,
                region: self.s3_region.clone(),
                endpoint: self.s3_endpoint.clone(),
                access_key_id: self.s3_access_key.clone(),
                secret_access_key: self.s3_secret_key.clone(),
            },
        };
        Ok(Some(ObjectStorageConfig {
            backend,
            prefix: self.prefix.clone(),
            public_base_url: self.public_base_url.clone(),
        }))
    }
}

/// Server configuration
///
/// Contains everything needed to run the gateway:
/// - Server settings (host, port, TLS)
/// - Authentication settings
/// - Security settings (CORS, rate limiting, connection limits)
/// - Collaborator endpoints and keys
/// - Pipeline tuning
/// - Storage backend
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Authentication configuration
    pub auth_api_secrets: Vec<AuthApiSecret>,
    pub auth_required: bool,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,

    pub providers: ProvidersConfig,
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            auth_api_secrets: Vec::new(),
            auth_required: false,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
            providers: ProvidersConfig::default(),
            pipeline: PipelineConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
/// This ensures sensitive data is cleared from memory immediately after use.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        let providers = &mut self.providers;
        for key in [
            &mut providers.transcription_api_key,
            &mut providers.chat_api_key,
            &mut providers.tts_api_key,
            &mut self.storage.s3_access_key,
            &mut self.storage.s3_secret_key,
        ]
        .into_iter()
        .flatten()
        {
            key.zeroize();
        }
        for secret in &mut self.auth_api_secrets {
            secret.secret.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables only
    ///
    /// Missing variables fall back to defaults. The result is validated.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file with environment variable base
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if the YAML file cannot be read or is malformed, an
    /// environment variable has an invalid format, or validation fails.
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        // .env is loaded in main.rs at startup, so the environment already
        // carries its values here
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Check if API secret authentication is configured
    pub fn has_api_secret_auth(&self) -> bool {
        !self.auth_api_secrets.is_empty()
    }
}

pub(crate) fn parse_auth_api_secrets_json(
    json_str: &str,
) -> Result<Vec<AuthApiSecret>, Box<dyn std::error::Error>> {
    #[derive(serde::Deserialize)]
    struct AuthApiSecretJson {
        id: String,
        secret: String,
    }

    let secrets: Vec<AuthApiSecretJson> = serde_json::from_str(json_str)
        .map_err(|e| format!("Invalid AUTH_API_SECRETS_JSON format: {e}"))?;

    Ok(secrets
        .into_iter()
        .map(|entry| AuthApiSecret {
            id: entry.id,
            secret: entry.secret,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    pub(super) fn cleanup_env_vars() {
        unsafe {
            for key in [
                "HOST",
                "PORT",
                "AUTH_REQUIRED",
                "AUTH_API_SECRETS_JSON",
                "AUTH_API_SECRET",
                "AUTH_API_SECRET_ID",
                "OPENAI_API_KEY",
                "TRANSCRIPTION_API_KEY",
                "CHAT_API_KEY",
                "CHAT_MODEL",
                "TTS_URL",
                "TTS_API_KEY",
                "TTS_VOICE",
                "PIPELINE_QUEUE_CAPACITY",
                "PIPELINE_OVERFLOW_POLICY",
                "PIPELINE_ENCODER",
                "WIRE_PROFILE",
                "STORAGE_BACKEND",
                "STORAGE_LOCAL_PATH",
                "STORAGE_PREFIX",
            ] {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.address(), "0.0.0.0:3001");
        assert!(!config.is_tls_enabled());
        assert!(!config.has_api_secret_auth());
        assert_eq!(config.pipeline.queue_capacity, 64);
        assert_eq!(config.pipeline.sentence_max_chars, 50);
        assert_eq!(config.pipeline.audio_packet_max_bytes, 8 * 1024);
        assert_eq!(config.pipeline.vlm_packet_max_bytes, 50 * 1024);
    }

    #[test]
    fn test_providers_conversion() {
        let mut config = ServerConfig::default();
        config.providers.chat_model = "qwen-plus".to_string();
        config.providers.tts_model = Some("qwen-tts-realtime".to_string());

        let chat = config.providers.chat();
        assert_eq!(chat.model, "qwen-plus");
        assert_eq!(chat.vlm_model, "qwen-plus");

        config.providers.vlm_model = Some("qwen-vl-max".to_string());
        assert_eq!(config.providers.chat().vlm_model, "qwen-vl-max");

        let tts = config.providers.synthesis();
        assert_eq!(tts.model.as_deref(), Some("qwen-tts-realtime"));
        assert_eq!(tts.sample_rate, 24_000);
    }

    #[test]
    fn test_storage_config() {
        let mut storage = StorageConfig::default();
        assert!(storage.object_storage().unwrap().is_none());

        storage.backend = StorageKind::Local;
        assert!(storage.object_storage().is_err());

        storage.local_path = Some(PathBuf::from("/tmp/duplex"));
        let resolved = storage.object_storage().unwrap().unwrap();
        assert_eq!(
            resolved.backend,
            StorageBackend::Local {
                root: PathBuf::from("/tmp/duplex")
            }
        );
        assert_eq!("S3".parse::<StorageKind>().unwrap(), StorageKind::S3);
        assert!("ftp".parse::<StorageKind>().is_err());
    }

    #[test]
    fn test_parse_auth_api_secrets_json() {
        let secrets =
            parse_auth_api_secrets_json(r#"[{"id":"a","secret":"s1"},{"id":"b","secret":"s2"}]"#)
                .unwrap();
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[1].id, "b");
        assert!(parse_auth_api_secrets_json("not json").is_err());
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

providers:
  chat_api_key: "yaml-chat-key"
  tts_voice: "Ethan"

pipeline:
  queue_capacity: 20
  overflow_policy: "drop"
  encoder: "mulaw"
  wire_profile: "envelope"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("CHAT_API_KEY", "env-chat-key");
            env::set_var("TTS_API_KEY", "env-tts-key");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.providers.chat_api_key,
            Some("yaml-chat-key".to_string())
        );
        // ENV value survives when YAML is silent
        assert_eq!(config.providers.tts_api_key, Some("env-tts-key".to_string()));
        assert_eq!(config.providers.tts_voice, "Ethan");
        assert_eq!(config.pipeline.queue_capacity, 20);
        assert_eq!(config.pipeline.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(config.pipeline.encoder, EncoderKind::Mulaw);
        assert_eq!(config.pipeline.wire_profile, WireProfile::Envelope);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_invalid_pipeline() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "pipeline:\n  queue_capacity: 0\n").unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("queue_capacity"));
    }

    #[test]
    #[serial]
    fn test_from_file_with_auth_and_storage() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let store_path = temp_dir.path().join("store");

        let yaml_content = format!(
            r#"
auth:
  required: true
  api_secrets:
    - id: "client-a"
      secret: "secret-a"

storage:
  backend: "local"
  local_path: "{}"
  prefix: "turns"
"#,
            store_path.display()
        );
        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert!(config.auth_required);
        assert_eq!(config.auth_api_secrets.len(), 1);
        assert_eq!(config.storage.backend, StorageKind::Local);
        assert_eq!(config.storage.local_path, Some(store_path));
        assert_eq!(config.storage.prefix, "turns");
    }
}

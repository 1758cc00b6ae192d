//! Environment variable loading.
//!
//! Every setting has a variable; unset variables leave the default in place.
//! Transcription and chat keys fall back to `OPENAI_API_KEY`.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{AuthApiSecret, ServerConfig, TlsConfig, parse_auth_api_secrets_json};

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(key: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {key}: {e}").into()),
        None => Ok(None),
    }
}

fn parse_bool(key: &str) -> Result<Option<bool>, Box<dyn std::error::Error>> {
    match var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(format!("Invalid boolean for {key}: '{other}'").into()),
        },
        None => Ok(None),
    }
}

macro_rules! set_from {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
}

/// Build a configuration from defaults plus environment variables
pub fn load_from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    set_from!(config.host, var("HOST"));
    set_from!(config.port, parse_var::<u16>("PORT")?);

    let tls_enabled = parse_bool("TLS_ENABLED")?.unwrap_or(false);
    if tls_enabled {
        let cert_path = var("TLS_CERT_PATH").ok_or("TLS_ENABLED is set but TLS_CERT_PATH is missing")?;
        let key_path = var("TLS_KEY_PATH").ok_or("TLS_ENABLED is set but TLS_KEY_PATH is missing")?;
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from(cert_path),
            key_path: PathBuf::from(key_path),
        });
    }

    // Auth
    set_from!(config.auth_required, parse_bool("AUTH_REQUIRED")?);
    if let Some(json) = var("AUTH_API_SECRETS_JSON") {
        config.auth_api_secrets = parse_auth_api_secrets_json(&json)?;
    } else if let Some(secret) = var("AUTH_API_SECRET") {
        config.auth_api_secrets = vec![AuthApiSecret {
            id: var("AUTH_API_SECRET_ID").unwrap_or_else(|| "default".to_string()),
            secret,
        }];
    }

    // Security
    config.cors_allowed_origins = var("CORS_ALLOWED_ORIGINS");
    set_from!(
        config.rate_limit_requests_per_second,
        parse_var("RATE_LIMIT_REQUESTS_PER_SECOND")?
    );
    set_from!(config.rate_limit_burst_size, parse_var("RATE_LIMIT_BURST_SIZE")?);
    if let Some(max) = parse_var::<usize>("MAX_WEBSOCKET_CONNECTIONS")? {
        config.max_websocket_connections = Some(max);
    }
    set_from!(config.max_connections_per_ip, parse_var("MAX_CONNECTIONS_PER_IP")?);

    // Providers
    let openai_key = var("OPENAI_API_KEY");
    let providers = &mut config.providers;
    set_from!(providers.transcription_base_url, var("TRANSCRIPTION_BASE_URL"));
    providers.transcription_api_key = var("TRANSCRIPTION_API_KEY").or_else(|| openai_key.clone());
    set_from!(providers.transcription_model, var("TRANSCRIPTION_MODEL"));
    providers.transcription_language = var("TRANSCRIPTION_LANGUAGE");
    set_from!(providers.chat_base_url, var("CHAT_BASE_URL"));
    providers.chat_api_key = var("CHAT_API_KEY").or(openai_key);
    set_from!(providers.chat_model, var("CHAT_MODEL"));
    providers.vlm_model = var("VLM_MODEL");
    providers.chat_temperature = parse_var("CHAT_TEMPERATURE")?;
    providers.chat_max_tokens = parse_var("CHAT_MAX_TOKENS")?;
    set_from!(providers.tts_url, var("TTS_URL"));
    providers.tts_api_key = var("TTS_API_KEY");
    providers.tts_model = var("TTS_MODEL");
    set_from!(providers.tts_voice, var("TTS_VOICE"));
    set_from!(providers.tts_sample_rate, parse_var("TTS_SAMPLE_RATE")?);

    // Pipeline
    let pipeline = &mut config.pipeline;
    set_from!(pipeline.queue_capacity, parse_var("PIPELINE_QUEUE_CAPACITY")?);
    set_from!(pipeline.overflow_policy, parse_var("PIPELINE_OVERFLOW_POLICY")?);
    set_from!(pipeline.transcode_workers, parse_var("PIPELINE_TRANSCODE_WORKERS")?);
    set_from!(pipeline.encoder, parse_var("PIPELINE_ENCODER")?);
    set_from!(pipeline.segment_duration_ms, parse_var("PIPELINE_SEGMENT_DURATION_MS")?);
    set_from!(pipeline.audio_packet_max_bytes, parse_var("AUDIO_PACKET_MAX_BYTES")?);
    set_from!(pipeline.vlm_packet_max_bytes, parse_var("VLM_PACKET_MAX_BYTES")?);
    set_from!(pipeline.max_packets_per_channel, parse_var("MAX_PACKETS_PER_CHANNEL")?);
    set_from!(pipeline.upload_timeout_seconds, parse_var("UPLOAD_TIMEOUT_SECONDS")?);
    set_from!(
        pipeline.first_response_timeout_seconds,
        parse_var("FIRST_RESPONSE_TIMEOUT_SECONDS")?
    );
    set_from!(pipeline.audio_turn_timeout_seconds, parse_var("AUDIO_TURN_TIMEOUT_SECONDS")?);
    set_from!(pipeline.vlm_turn_timeout_seconds, parse_var("VLM_TURN_TIMEOUT_SECONDS")?);
    set_from!(pipeline.idle_timeout_seconds, parse_var("IDLE_TIMEOUT_SECONDS")?);
    set_from!(pipeline.sentence_max_chars, parse_var("SENTENCE_MAX_CHARS")?);
    set_from!(pipeline.system_prompt, var("SYSTEM_PROMPT"));
    set_from!(pipeline.wire_profile, parse_var("WIRE_PROFILE")?);
    set_from!(pipeline.persist_failures, parse_bool("PERSIST_FAILURES")?);

    // Storage
    let storage = &mut config.storage;
    set_from!(storage.backend, parse_var("STORAGE_BACKEND")?);
    storage.local_path = var("STORAGE_LOCAL_PATH").map(PathBuf::from);
    storage.s3_bucket = var("STORAGE_S3_BUCKET");
    storage.s3_region = var("STORAGE_S3_REGION");
    storage.s3_endpoint = var("STORAGE_S3_ENDPOINT");
    storage.s3_access_key = var("STORAGE_S3_ACCESS_KEY");
    storage.s3_secret_key = var("STORAGE_S3_SECRET_KEY");
    set_from!(storage.prefix, var("STORAGE_PREFIX"));
    storage.public_base_url = var("STORAGE_PUBLIC_BASE_URL");

    Ok(config)
}

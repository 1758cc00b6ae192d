use std::path::PathBuf;
use std::str::FromStr;

use super::env::load_from_env;
use super::yaml::YamlConfig;
use super::{AuthApiSecret, ServerConfig, TlsConfig};

fn parse_field<T>(field: &str, raw: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| format!("Invalid value for {field}: {e}").into())
}

macro_rules! overlay {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
}

/// Environment (with defaults) as the base, YAML values on top
pub fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = load_from_env()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        overlay!(config.host, server.host);
        overlay!(config.port, server.port);
        if let Some(tls) = server.tls {
            match tls.enabled {
                Some(false) => config.tls = None,
                Some(true) | None => {
                    if let (Some(cert), Some(key)) = (tls.cert_path, tls.key_path) {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        });
                    } else if tls.enabled == Some(true) {
                        return Err("server.tls.enabled requires cert_path and key_path".into());
                    }
                }
            }
        }
    }

    if let Some(auth) = yaml.auth {
        overlay!(config.auth_required, auth.required);
        if !auth.api_secrets.is_empty() {
            config.auth_api_secrets = auth
                .api_secrets
                .into_iter()
                .map(|entry| AuthApiSecret {
                    id: entry.id,
                    secret: entry.secret,
                })
                .collect();
        } else if let Some(secret) = auth.api_secret {
            config.auth_api_secrets = vec![AuthApiSecret {
                id: "default".to_string(),
                secret,
            }];
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        overlay!(
            config.rate_limit_requests_per_second,
            security.rate_limit_requests_per_second
        );
        overlay!(config.rate_limit_burst_size, security.rate_limit_burst_size);
        if security.max_websocket_connections.is_some() {
            config.max_websocket_connections = security.max_websocket_connections;
        }
        overlay!(config.max_connections_per_ip, security.max_connections_per_ip);
    }

    if let Some(p) = yaml.providers {
        let providers = &mut config.providers;
        overlay!(providers.transcription_base_url, p.transcription_base_url);
        overlay!(providers.transcription_model, p.transcription_model);
        overlay!(providers.chat_base_url, p.chat_base_url);
        overlay!(providers.chat_model, p.chat_model);
        overlay!(providers.tts_url, p.tts_url);
        overlay!(providers.tts_voice, p.tts_voice);
        overlay!(providers.tts_sample_rate, p.tts_sample_rate);
        for (target, value) in [
            (&mut providers.transcription_api_key, p.transcription_api_key),
            (&mut providers.transcription_language, p.transcription_language),
            (&mut providers.chat_api_key, p.chat_api_key),
            (&mut providers.vlm_model, p.vlm_model),
            (&mut providers.tts_api_key, p.tts_api_key),
            (&mut providers.tts_model, p.tts_model),
        ] {
            if value.is_some() {
                *target = value;
            }
        }
        if p.chat_temperature.is_some() {
            providers.chat_temperature = p.chat_temperature;
        }
        if p.chat_max_tokens.is_some() {
            providers.chat_max_tokens = p.chat_max_tokens;
        }
    }

    if let Some(p) = yaml.pipeline {
        let pipeline = &mut config.pipeline;
        overlay!(pipeline.queue_capacity, p.queue_capacity);
        if let Some(raw) = p.overflow_policy {
            pipeline.overflow_policy = parse_field("pipeline.overflow_policy", &raw)?;
        }
        overlay!(pipeline.transcode_workers, p.transcode_workers);
        if let Some(raw) = p.encoder {
            pipeline.encoder = parse_field("pipeline.encoder", &raw)?;
        }
        overlay!(pipeline.segment_duration_ms, p.segment_duration_ms);
        overlay!(pipeline.audio_packet_max_bytes, p.audio_packet_max_bytes);
        overlay!(pipeline.vlm_packet_max_bytes, p.vlm_packet_max_bytes);
        overlay!(pipeline.max_packets_per_channel, p.max_packets_per_channel);
        overlay!(pipeline.upload_timeout_seconds, p.upload_timeout_seconds);
        overlay!(
            pipeline.first_response_timeout_seconds,
            p.first_response_timeout_seconds
        );
        overlay!(pipeline.audio_turn_timeout_seconds, p.audio_turn_timeout_seconds);
        overlay!(pipeline.vlm_turn_timeout_seconds, p.vlm_turn_timeout_seconds);
        overlay!(pipeline.idle_timeout_seconds, p.idle_timeout_seconds);
        overlay!(pipeline.sentence_max_chars, p.sentence_max_chars);
        overlay!(pipeline.system_prompt, p.system_prompt);
        if let Some(raw) = p.wire_profile {
            pipeline.wire_profile = parse_field("pipeline.wire_profile", &raw)?;
        }
        overlay!(pipeline.persist_failures, p.persist_failures);
    }

    if let Some(s) = yaml.storage {
        let storage = &mut config.storage;
        if let Some(raw) = s.backend {
            storage.backend = parse_field("storage.backend", &raw)?;
        }
        if let Some(path) = s.local_path {
            storage.local_path = Some(PathBuf::from(path));
        }
        for (target, value) in [
            (&mut storage.s3_bucket, s.s3_bucket),
            (&mut storage.s3_region, s.s3_region),
            (&mut storage.s3_endpoint, s.s3_endpoint),
            (&mut storage.s3_access_key, s.s3_access_key),
            (&mut storage.s3_secret_key, s.s3_secret_key),
            (&mut storage.public_base_url, s.public_base_url),
        ] {
            if value.is_some() {
                *target = value;
            }
        }
        overlay!(storage.prefix, s.prefix);
    }

    Ok(config)
}

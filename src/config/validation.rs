use super::{AuthApiSecret, PipelineConfig, ServerConfig, StorageConfig, TlsConfig};

/// Run every check against a fully merged configuration
pub fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_tls(&config.tls)?;
    validate_auth_api_secrets(&config.auth_api_secrets)?;
    validate_auth_required(config.auth_required, &config.auth_api_secrets)?;
    validate_pipeline(&config.pipeline)?;
    validate_storage(&config.storage)?;
    config.providers.transcription().validate()?;
    config.providers.chat().validate()?;
    config.providers.synthesis().validate()?;
    Ok(())
}

pub fn validate_tls(tls: &Option<TlsConfig>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(tls) = tls
        && (tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty())
    {
        return Err("TLS requires both a certificate and a key path".into());
    }
    Ok(())
}

pub fn validate_auth_api_secrets(
    secrets: &[AuthApiSecret],
) -> Result<(), Box<dyn std::error::Error>> {
    for (index, entry) in secrets.iter().enumerate() {
        if entry.id.trim().is_empty() {
            return Err(format!("auth.api_secrets[{index}] has an empty id").into());
        }
        if entry.secret.trim().is_empty() {
            return Err(format!("auth.api_secrets[{index}] ({}) has an empty secret", entry.id).into());
        }
    }
    Ok(())
}

pub fn validate_auth_required(
    auth_required: bool,
    secrets: &[AuthApiSecret],
) -> Result<(), Box<dyn std::error::Error>> {
    if auth_required && secrets.is_empty() {
        return Err(
            "Authentication is required but no API secrets are configured. \
             Set AUTH_API_SECRETS_JSON, AUTH_API_SECRET or auth.api_secrets"
                .into(),
        );
    }
    Ok(())
}

pub fn validate_pipeline(pipeline: &PipelineConfig) -> Result<(), Box<dyn std::error::Error>> {
    let positive = [
        ("pipeline.queue_capacity", pipeline.queue_capacity as u64),
        ("pipeline.transcode_workers", pipeline.transcode_workers as u64),
        ("pipeline.segment_duration_ms", pipeline.segment_duration_ms as u64),
        ("pipeline.audio_packet_max_bytes", pipeline.audio_packet_max_bytes as u64),
        ("pipeline.vlm_packet_max_bytes", pipeline.vlm_packet_max_bytes as u64),
        ("pipeline.max_packets_per_channel", pipeline.max_packets_per_channel as u64),
        ("pipeline.upload_timeout_seconds", pipeline.upload_timeout_seconds),
        (
            "pipeline.first_response_timeout_seconds",
            pipeline.first_response_timeout_seconds,
        ),
        ("pipeline.audio_turn_timeout_seconds", pipeline.audio_turn_timeout_seconds),
        ("pipeline.vlm_turn_timeout_seconds", pipeline.vlm_turn_timeout_seconds),
        ("pipeline.idle_timeout_seconds", pipeline.idle_timeout_seconds),
        ("pipeline.sentence_max_chars", pipeline.sentence_max_chars as u64),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(format!("{field} must be greater than zero").into());
        }
    }
    Ok(())
}

pub fn validate_storage(storage: &StorageConfig) -> Result<(), Box<dyn std::error::Error>> {
    storage.object_storage()?;
    Ok(())
}

//! Shared application state.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::info;

use crate::config::ServerConfig;
use crate::core::llm::OpenAICompatChat;
use crate::core::storage::{CompletionStore, ObjectStorage, Uploader};
use crate::core::stt::OpenAICompatTranscriber;
use crate::core::transcode::TranscodeWorkers;
use crate::core::tts::RealtimeTtsClient;
use crate::errors::AppError;
use crate::session::{PipelineDeps, PipelineSettings, SessionLimits, SessionManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

/// Application state shared by every handler
pub struct AppState {
    pub config: ServerConfig,
    pub sessions: SessionManager,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
}

impl AppState {
    /// Build the real collaborator clients from configuration
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, AppError> {
        let transcriber = OpenAICompatTranscriber::new(config.providers.transcription())
            .map_err(|e| AppError::Config(e.to_string()))?;
        let chat = OpenAICompatChat::new(config.providers.chat())
            .map_err(|e| AppError::Config(e.to_string()))?;
        let synthesizer = RealtimeTtsClient::new(config.providers.synthesis())
            .map_err(|e| AppError::Config(e.to_string()))?;

        let storage = match config.storage.object_storage().map_err(AppError::Config)? {
            Some(storage_config) => Some(Arc::new(ObjectStorage::from_config(&storage_config)?)),
            None => {
                info!("Storage disabled, uploads and completion records are skipped");
                None
            }
        };

        let settings = PipelineSettings::new(
            &config.pipeline,
            config.providers.tts_sample_rate,
            config.storage.prefix.clone(),
        );
        let deps = PipelineDeps {
            transcriber: Arc::new(transcriber),
            chat: Arc::new(chat),
            synthesizer: Arc::new(synthesizer),
            uploader: storage.clone().map(|s| s as Arc<dyn Uploader>),
            store: storage.map(|s| s as Arc<dyn CompletionStore>),
            workers: TranscodeWorkers::new(config.pipeline.transcode_workers),
            settings: Arc::new(settings),
        };

        Ok(Self::with_dependencies(config, deps))
    }

    /// State around caller-supplied collaborators
    pub fn with_dependencies(config: ServerConfig, deps: PipelineDeps) -> Arc<Self> {
        let sessions = SessionManager::new(
            deps,
            SessionLimits::from(&config.pipeline),
            config.pipeline.upload_timeout(),
        );
        Arc::new(Self {
            config,
            sessions,
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    /// Reserve a WebSocket slot for `ip`
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip as usize {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        let max = self.config.max_websocket_connections;
        let reserved = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| match max {
                Some(max) if current >= max => None,
                _ => Some(current + 1),
            });
        if reserved.is_err() {
            drop(per_ip);
            self.ip_connections.remove_if(&ip, |_, count| *count == 0);
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        *per_ip += 1;
        Ok(())
    }

    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
        self.ip_connections.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|c| *c).unwrap_or(0)
    }
}

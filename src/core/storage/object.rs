use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::{debug, info, warn};

use super::{CompletionRecord, CompletionStore, StorageError, Uploader, record_key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct ObjectStorageConfig {
    pub backend: StorageBackend,
    pub prefix: String,
    /// Prepended to object keys when reporting URLs
    pub public_base_url: Option<String>,
}

/// `object_store`-backed uploader and record store
#[derive(Clone)]
pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    url_base: String,
}

impl std::fmt::Debug for ObjectStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStorage")
            .field("store", &self.store.to_string())
            .field("prefix", &self.prefix)
            .field("url_base", &self.url_base)
            .finish()
    }
}

impl ObjectStorage {
    pub fn from_config(config: &ObjectStorageConfig) -> Result<Self, StorageError> {
        let (store, default_base): (Arc<dyn ObjectStore>, String) = match &config.backend {
            StorageBackend::Memory => (Arc::new(InMemory::new()), "memory:///".to_string()),
            StorageBackend::Local { root } => {
                std::fs::create_dir_all(root).map_err(|e| {
                    StorageError::Configuration(format!(
                        "Failed to create storage directory {}: {e}",
                        root.display()
                    ))
                })?;
                let fs = LocalFileSystem::new_with_prefix(root)
                    .map_err(|e| StorageError::Configuration(e.to_string()))?;
                let base = format!("file://{}/", root.display().to_string().trim_end_matches('/'));
                (Arc::new(fs), base)
            }
            StorageBackend::S3 {
                bucket,
                region,
                endpoint,
                access_key_id,
                secret_access_key,
            } => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                if let Some(key) = access_key_id {
                    builder = builder.with_access_key_id(key);
                }
                if let Some(secret) = secret_access_key {
                    builder = builder.with_secret_access_key(secret);
                }
                let s3 = builder
                    .build()
                    .map_err(|e| StorageError::Configuration(e.to_string()))?;
                (Arc::new(s3), format!("s3://{bucket}/"))
            }
        };

        let url_base = match &config.public_base_url {
            Some(base) => format!("{}/", base.trim_end_matches('/')),
            None => default_base,
        };

        info!(store = %store, prefix = %config.prefix, "Object storage initialized");
        Ok(Self {
            store,
            prefix: config.prefix.clone(),
            url_base,
        })
    }

    /// Wrap an existing store
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, url_base: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            url_base: url_base.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.clone()
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}{}", self.url_base, key)
    }

    /// Create-only put. Backends without conditional writes fall back to a
    /// head check followed by a plain put.
    async fn put_once(&self, key: &str, payload: Bytes) -> Result<(), StorageError> {
        let path = ObjectPath::parse(key)
            .map_err(|e| StorageError::Configuration(format!("Invalid object key '{key}': {e}")))?;
        let options = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };

        match self
            .store
            .put_opts(&path, PutPayload::from(payload.clone()), options)
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::NotImplemented) => {
                debug!(key, "Conditional put unsupported, falling back to head check");
                match self.store.head(&path).await {
                    Ok(_) => Err(StorageError::AlreadyExists(key.to_string())),
                    Err(object_store::Error::NotFound { .. }) => {
                        self.store.put(&path, PutPayload::from(payload)).await?;
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Uploader for ObjectStorage {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError> {
        let path = ObjectPath::parse(key)
            .map_err(|e| StorageError::Configuration(format!("Invalid object key '{key}': {e}")))?;
        let size = data.len();
        self.store.put(&path, PutPayload::from(data)).await?;
        debug!(key, size, "Uploaded object");
        Ok(self.url_for(key))
    }
}

#[async_trait]
impl CompletionStore for ObjectStorage {
    async fn persist(&self, record: &CompletionRecord) -> Result<(), StorageError> {
        let key = record_key(&self.prefix, &record.session_id, record.turn);
        let body = serde_json::to_vec(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        match self.put_once(&key, Bytes::from(body)).await {
            Ok(()) => {
                info!(
                    session_id = %record.session_id,
                    turn = record.turn,
                    outcome = ?record.outcome,
                    "Persisted completion record"
                );
                Ok(())
            }
            Err(e) => {
                warn!(key, "Failed to persist completion record: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{TurnOutcome, input_key};

    fn record(turn: u32) -> CompletionRecord {
        CompletionRecord {
            session_id: "s1".to_string(),
            turn,
            variant: "audio".to_string(),
            outcome: TurnOutcome::Success,
            transcript: "hello".to_string(),
            response: "hi there".to_string(),
            audio_url: None,
            image_url: None,
            tts_success: true,
            segments_count: 1,
            audio_chunks: 2,
            dropped_frames: 0,
            error_code: None,
            error_message: None,
            started_at: "2024-01-01T00:00:00Z".to_string(),
            transcription_ms: Some(10),
            generation_ms: Some(20),
            total_ms: 40,
        }
    }

    fn memory() -> ObjectStorage {
        ObjectStorage::from_config(&ObjectStorageConfig {
            backend: StorageBackend::Memory,
            prefix: "duplex".to_string(),
            public_base_url: Some("https://cdn.example.com/".to_string()),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_returns_public_url() {
        let storage = memory();
        let key = input_key(storage.prefix(), "s1", 1, "audio.bin");
        let url = storage.upload(&key, Bytes::from_static(b"pcm")).await.unwrap();
        assert_eq!(url, "https://cdn.example.com/duplex/s1/1/audio.bin");

        let stored = storage
            .store()
            .get(&ObjectPath::from(key.as_str()))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(stored.as_ref(), b"pcm");
    }

    #[tokio::test]
    async fn test_persist_is_write_once() {
        let storage = memory();
        storage.persist(&record(1)).await.unwrap();
        let again = storage.persist(&record(1)).await;
        assert!(matches!(again, Err(StorageError::AlreadyExists(_))));
        storage.persist(&record(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ObjectStorage::from_config(&ObjectStorageConfig {
            backend: StorageBackend::Local {
                root: dir.path().join("store"),
            },
            prefix: String::new(),
            public_base_url: None,
        })
        .unwrap();

        storage.persist(&record(1)).await.unwrap();
        let path = dir.path().join("store/records/s1-1.json");
        let body = std::fs::read(path).unwrap();
        let parsed: CompletionRecord = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, record(1));

        let url = storage.upload("s1/1/image.bin", Bytes::from_static(b"img")).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("/s1/1/image.bin"));
    }
}

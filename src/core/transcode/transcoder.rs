//! Streaming PCM to compact-format converter.
//!
//! PCM is buffered until one segment (default 500 ms) is available; each full
//! segment is encoded and forwarded immediately, and the remainder is flushed
//! when the queue closes. Encoding is CPU work, so it runs on the blocking pool
//! under a process-wide permit pool shared by every session.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, warn};

use super::TranscodeError;
use super::encoder::{EncoderKind, SegmentEncoder, create_encoder};
use super::queue::FrameConsumer;

/// Default segment length
pub const DEFAULT_SEGMENT_DURATION_MS: u32 = 500;

/// Default synthesis sample rate (16-bit mono)
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, Copy)]
pub struct TranscoderConfig {
    pub sample_rate: u32,
    pub segment_duration_ms: u32,
    pub encoder: EncoderKind,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            segment_duration_ms: DEFAULT_SEGMENT_DURATION_MS,
            encoder: EncoderKind::default(),
        }
    }
}

impl TranscoderConfig {
    /// PCM bytes per segment, always a whole number of samples
    pub fn segment_bytes(&self) -> usize {
        let samples =
            (self.sample_rate as u64 * self.segment_duration_ms as u64 / 1000).max(1) as usize;
        samples * BYTES_PER_SAMPLE
    }
}

/// Process-wide pool of transcoding permits.
///
/// Sized independently of the number of sessions; each session still has its
/// own queue, so a busy session waits for a permit without starving others of
/// queue space.
#[derive(Debug, Clone)]
pub struct TranscodeWorkers {
    permits: Arc<Semaphore>,
    size: usize,
}

impl TranscodeWorkers {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Encoded chunk in emission order
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub seq: u64,
    pub data: Bytes,
    pub format: &'static str,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranscodeSummary {
    pub chunks: u64,
    pub pcm_bytes: u64,
    pub encoded_bytes: u64,
}

/// Single writer of a session's encoded output
pub struct Transcoder {
    config: TranscoderConfig,
    encoder: Option<Box<dyn SegmentEncoder>>,
    workers: TranscodeWorkers,
    pending: BytesMut,
    summary: TranscodeSummary,
}

impl Transcoder {
    pub fn new(config: TranscoderConfig, workers: TranscodeWorkers) -> Self {
        let encoder = create_encoder(config.encoder, config.sample_rate);
        Self::with_encoder(config, encoder, workers)
    }

    pub fn with_encoder(
        config: TranscoderConfig,
        encoder: Box<dyn SegmentEncoder>,
        workers: TranscodeWorkers,
    ) -> Self {
        Self {
            config,
            encoder: Some(encoder),
            workers,
            pending: BytesMut::with_capacity(config.segment_bytes() * 2),
            summary: TranscodeSummary::default(),
        }
    }

    /// Drain `frames` until the producer closes, emitting chunks to `out` as
    /// soon as each segment is encoded.
    pub async fn run(
        mut self,
        mut frames: FrameConsumer,
        out: mpsc::Sender<EncodedChunk>,
    ) -> Result<TranscodeSummary, TranscodeError> {
        let segment_bytes = self.config.segment_bytes();

        while let Some(frame) = frames.recv().await {
            self.summary.pcm_bytes += frame.data.len() as u64;
            self.pending.extend_from_slice(&frame.data);

            while self.pending.len() >= segment_bytes {
                let segment = self.pending.split_to(segment_bytes).freeze();
                self.encode_and_send(segment, &out).await?;
            }
        }

        if !self.pending.is_empty() {
            let rest = self.pending.split().freeze();
            self.encode_and_send(rest, &out).await?;
        }

        debug!(
            chunks = self.summary.chunks,
            pcm_bytes = self.summary.pcm_bytes,
            encoded_bytes = self.summary.encoded_bytes,
            "Transcoder drained"
        );
        Ok(self.summary)
    }

    async fn encode_and_send(
        &mut self,
        segment: Bytes,
        out: &mpsc::Sender<EncodedChunk>,
    ) -> Result<(), TranscodeError> {
        let data = self.encode(segment).await?;
        if data.is_empty() {
            return Ok(());
        }

        let format = self
            .encoder
            .as_ref()
            .map(|encoder| encoder.format())
            .unwrap_or("unknown");
        let chunk = EncodedChunk {
            seq: self.summary.chunks,
            data,
            format,
        };
        self.summary.chunks += 1;
        self.summary.encoded_bytes += chunk.data.len() as u64;

        out.send(chunk)
            .await
            .map_err(|_| TranscodeError::OutputClosed)
    }

    async fn encode(&mut self, segment: Bytes) -> Result<Bytes, TranscodeError> {
        let permit = self
            .workers
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TranscodeError::Worker(e.to_string()))?;
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| TranscodeError::Worker("encoder lost after failure".to_string()))?;

        let (encoder, result) = tokio::task::spawn_blocking(move || {
            let result = encoder.encode(&segment);
            drop(permit);
            (encoder, result)
        })
        .await
        .map_err(|e| {
            warn!("Transcode worker panicked: {}", e);
            TranscodeError::Worker(e.to_string())
        })?;

        self.encoder = Some(encoder);
        result
    }
}

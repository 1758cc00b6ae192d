//! Incremental PCM transcoding behind a bounded queue.
//!
//! ```text
//! synthesis frames ──▶ FrameProducer ══ bounded queue ══▶ FrameConsumer ──▶ Transcoder ──▶ EncodedChunk
//! ```

pub mod encoder;
pub mod queue;
pub mod transcoder;

use thiserror::Error;

pub use encoder::{EncoderKind, MulawEncoder, SegmentEncoder, WavSegmentEncoder, create_encoder};
pub use queue::{
    DEFAULT_QUEUE_CAPACITY, FrameConsumer, FrameProducer, OverflowPolicy, PushOutcome,
    QueueMonitor, QueueStats, RawFrame, frame_queue,
};
pub use transcoder::{EncodedChunk, TranscodeSummary, TranscodeWorkers, Transcoder, TranscoderConfig};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Frame queue closed")]
    QueueClosed,

    #[error("Encoded output receiver dropped")]
    OutputClosed,

    #[error("Transcode worker failure: {0}")]
    Worker(String),
}

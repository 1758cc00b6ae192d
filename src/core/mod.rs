pub mod llm;
pub mod openai;
pub mod reassembly;
pub mod storage;
pub mod stt;
pub mod transcode;
pub mod tts;

// Re-export commonly used types for convenience
pub use reassembly::{
    Channel, ChannelPolicy, CompletionMode, Packet, ReassemblyBuffer, ReassemblyError, Reassembler,
    SubmitReport,
};

pub use stt::{OpenAICompatTranscriber, Transcriber, TranscriptionConfig, TranscriptionError};

pub use llm::{ChatContext, ChatError, ChatStreamer, ImageRef, OpenAICompatChat, TextDeltaStream};

pub use tts::{
    RealtimeSynthesizer, RealtimeTtsClient, RealtimeTtsConfig, SynthesisError, SynthesisSession,
};

pub use transcode::{EncoderKind, OverflowPolicy, TranscodeError, TranscodeWorkers};

pub use storage::{CompletionRecord, CompletionStore, ObjectStorage, StorageError, Uploader};

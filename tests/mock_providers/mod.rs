//! Scripted collaborator doubles for pipeline tests
//!
//! Each double records what it was asked to do so tests can assert on the
//! calls as well as on the emitted events.

// Not every test binary uses every double
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use duplex_gateway::core::llm::{ChatContext, ChatError, ChatStreamer, TextDeltaStream};
use duplex_gateway::core::storage::{CompletionRecord, CompletionStore, StorageError, Uploader};
use duplex_gateway::core::stt::{Transcriber, TranscriptionError};
use duplex_gateway::core::transcode::TranscodeWorkers;
use duplex_gateway::core::tts::{
    RealtimeSynthesizer, SynthesisCommand, SynthesisError, SynthesisSession,
};
use duplex_gateway::session::{
    EventSink, PipelineDeps, PipelineSettings, SessionEvent, SessionLimits, SessionManager,
};

// =============================================================================
// Transcription
// =============================================================================

pub struct ScriptedTranscriber {
    reply: Result<String, String>,
    delay: Duration,
    pub calls: AtomicUsize,
    pub last_audio: Mutex<Option<Bytes>>,
}

impl ScriptedTranscriber {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_audio: Mutex::new(None),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            last_audio: Mutex::new(None),
        })
    }

    pub fn slow(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Ok(text.to_string()),
            delay,
            calls: AtomicUsize::new(0),
            last_audio: Mutex::new(None),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio: Bytes) -> Result<String, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_audio.lock() = Some(audio);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .clone()
            .map_err(TranscriptionError::ProviderError)
    }
}

// =============================================================================
// Chat
// =============================================================================

pub enum ChatScript {
    /// Stream these deltas, then end
    Deltas(Vec<String>),
    /// Stream these deltas, then fail the stream
    FailAfter(Vec<String>, String),
    /// Refuse to open the stream
    Refuse(String),
    /// Stream these deltas, then never finish
    Hang(Vec<String>),
}

pub struct ScriptedChat {
    script: ChatScript,
    pub contexts: Mutex<Vec<ChatContext>>,
}

impl ScriptedChat {
    pub fn new(script: ChatScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            contexts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(deltas: &[&str]) -> Arc<Self> {
        Self::new(ChatScript::Deltas(
            deltas.iter().map(|d| d.to_string()).collect(),
        ))
    }

    pub fn call_count(&self) -> usize {
        self.contexts.lock().len()
    }
}

#[async_trait]
impl ChatStreamer for ScriptedChat {
    async fn stream_chat(&self, context: ChatContext) -> Result<TextDeltaStream, ChatError> {
        self.contexts.lock().push(context);
        match &self.script {
            ChatScript::Deltas(deltas) => {
                let items: Vec<Result<String, ChatError>> =
                    deltas.iter().cloned().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            ChatScript::FailAfter(deltas, message) => {
                let mut items: Vec<Result<String, ChatError>> =
                    deltas.iter().cloned().map(Ok).collect();
                items.push(Err(ChatError::StreamError(message.clone())));
                Ok(Box::pin(stream::iter(items)))
            }
            ChatScript::Refuse(message) => Err(ChatError::ProviderError(message.clone())),
            ChatScript::Hang(deltas) => {
                let items: Vec<Result<String, ChatError>> =
                    deltas.iter().cloned().map(Ok).collect();
                Ok(Box::pin(
                    futures::StreamExt::chain(stream::iter(items), stream::pending()),
                ))
            }
        }
    }
}

// =============================================================================
// Synthesis
// =============================================================================

pub enum SynthesisScript {
    /// `frames` PCM frames of `frame_bytes` each per appended segment
    Frames { frames: usize, frame_bytes: usize },
    /// Refuse to open
    Refuse(String),
    /// Fail the output after the first segment
    FailAfterFirst(String),
    /// Accept text but never produce audio or finish
    Silent,
}

pub struct ScriptedSynthesizer {
    script: SynthesisScript,
    pub segments: Arc<Mutex<Vec<String>>>,
    pub finished: Arc<AtomicUsize>,
}

impl ScriptedSynthesizer {
    pub fn new(script: SynthesisScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            segments: Arc::new(Mutex::new(Vec::new())),
            finished: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Two 960-byte frames per segment
    pub fn pcm() -> Arc<Self> {
        Self::new(SynthesisScript::Frames {
            frames: 2,
            frame_bytes: 960,
        })
    }

    pub fn segments(&self) -> Vec<String> {
        self.segments.lock().clone()
    }

    fn open_silent(&self) -> SynthesisSession {
        let (session, mut backend) = SynthesisSession::channel(1024);
        let segments = self.segments.clone();
        let finished = self.finished.clone();
        let task = tokio::spawn(async move {
            while let Some(command) = backend.commands.recv().await {
                match command {
                    SynthesisCommand::Append(text) => segments.lock().push(text),
                    SynthesisCommand::Finish => {
                        finished.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            // keep the frame sender open so the output never ends
            let _frames = backend.frames;
            std::future::pending::<()>().await;
        });
        session.with_io_task(task)
    }
}

#[async_trait]
impl RealtimeSynthesizer for ScriptedSynthesizer {
    async fn open(&self) -> Result<SynthesisSession, SynthesisError> {
        let (frames, frame_bytes, fail) = match &self.script {
            SynthesisScript::Refuse(message) => {
                return Err(SynthesisError::ConnectionFailed(message.clone()));
            }
            SynthesisScript::Frames {
                frames,
                frame_bytes,
            } => (*frames, *frame_bytes, None),
            SynthesisScript::FailAfterFirst(message) => (1, 960, Some(message.clone())),
            SynthesisScript::Silent => return Ok(self.open_silent()),
        };

        let (session, mut backend) = SynthesisSession::channel(1024);
        let segments = self.segments.clone();
        let finished = self.finished.clone();

        let task = tokio::spawn(async move {
            while let Some(command) = backend.commands.recv().await {
                match command {
                    SynthesisCommand::Append(text) => {
                        segments.lock().push(text);
                        for _ in 0..frames {
                            let frame = Bytes::from(vec![0u8; frame_bytes]);
                            if backend.frames.send(Ok(frame)).await.is_err() {
                                return;
                            }
                        }
                        if let Some(message) = &fail {
                            let _ = backend
                                .frames
                                .send(Err(SynthesisError::ProviderError(message.clone())))
                                .await;
                            return;
                        }
                    }
                    SynthesisCommand::Finish => {
                        finished.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                }
            }
        });
        Ok(session.with_io_task(task))
    }
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Default)]
pub struct RecordingStore {
    pub records: Mutex<Vec<CompletionRecord>>,
    pub uploads: Mutex<Vec<(String, usize)>>,
    fail_persist: bool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_persist: true,
            ..Default::default()
        })
    }

    pub fn records(&self) -> Vec<CompletionRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl Uploader for RecordingStore {
    async fn upload(&self, key: &str, data: Bytes) -> Result<String, StorageError> {
        self.uploads.lock().push((key.to_string(), data.len()));
        Ok(format!("https://cdn.test/{key}"))
    }
}

#[async_trait]
impl CompletionStore for RecordingStore {
    async fn persist(&self, record: &CompletionRecord) -> Result<(), StorageError> {
        if self.fail_persist {
            return Err(StorageError::Backend("bucket unavailable".to_string()));
        }
        self.records.lock().push(record.clone());
        Ok(())
    }
}

// =============================================================================
// Wiring
// =============================================================================

/// Settings with 10 ms transcoding segments (480 bytes at 24 kHz)
pub fn test_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.transcoder.segment_duration_ms = 10;
    settings.first_response_timeout = Duration::from_secs(5);
    settings.audio_turn_timeout = Duration::from_secs(20);
    settings.vlm_turn_timeout = Duration::from_secs(20);
    settings
}

pub fn deps(
    transcriber: Arc<ScriptedTranscriber>,
    chat: Arc<ScriptedChat>,
    synthesizer: Arc<ScriptedSynthesizer>,
    store: Option<Arc<RecordingStore>>,
    settings: PipelineSettings,
) -> PipelineDeps {
    PipelineDeps {
        transcriber,
        chat,
        synthesizer,
        uploader: store.clone().map(|s| s as Arc<dyn Uploader>),
        store: store.map(|s| s as Arc<dyn CompletionStore>),
        workers: TranscodeWorkers::new(2),
        settings: Arc::new(settings),
    }
}

pub fn manager(deps: PipelineDeps, upload_timeout: Duration) -> SessionManager {
    SessionManager::new(deps, SessionLimits::default(), upload_timeout)
}

pub async fn next_event(rx: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events up to and including the turn's summary or error
pub async fn collect_turn(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let last = matches!(event, SessionEvent::Summary(_) | SessionEvent::Error { .. });
        events.push(event);
        if last {
            return events;
        }
    }
}

pub fn events_channel() -> (EventSink, mpsc::Receiver<SessionEvent>) {
    EventSink::channel(4096)
}

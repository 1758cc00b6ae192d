//! Realtime speech synthesis collaborator.
//!
//! A synthesis session is duplex: text is appended incrementally while raw
//! PCM frames stream back. The two halves are independent so the pipeline can
//! keep feeding sentences while a separate task drains audio.

pub mod realtime;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::task::AbortOnDropHandle;

pub use realtime::{RealtimeTtsClient, RealtimeTtsConfig};

/// Channel capacity for commands and frames of one session
pub const SESSION_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Synthesis session closed")]
    SessionClosed,
}

/// Input commands for a synthesis session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisCommand {
    Append(String),
    Finish,
}

/// Text side of a session
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    tx: mpsc::Sender<SynthesisCommand>,
}

impl SynthesisInput {
    pub async fn append(&self, text: impl Into<String>) -> Result<(), SynthesisError> {
        self.tx
            .send(SynthesisCommand::Append(text.into()))
            .await
            .map_err(|_| SynthesisError::SessionClosed)
    }

    /// Signal that no more text follows. Audio keeps arriving on the output
    /// until the provider reports the session finished.
    pub async fn finish(&self) -> Result<(), SynthesisError> {
        self.tx
            .send(SynthesisCommand::Finish)
            .await
            .map_err(|_| SynthesisError::SessionClosed)
    }
}

/// Audio side of a session. Dropping it aborts the provider IO task.
pub struct SynthesisOutput {
    rx: mpsc::Receiver<Result<Bytes, SynthesisError>>,
    _io_task: Option<AbortOnDropHandle<()>>,
}

impl SynthesisOutput {
    /// Next PCM frame; `None` once the provider has finished
    pub async fn next_frame(&mut self) -> Option<Result<Bytes, SynthesisError>> {
        self.rx.recv().await
    }
}

/// Both halves of an open session
pub struct SynthesisSession {
    pub input: SynthesisInput,
    pub output: SynthesisOutput,
}

/// Provider end of a session created with [`SynthesisSession::channel`]
#[derive(Debug)]
pub struct SynthesisBackend {
    pub commands: mpsc::Receiver<SynthesisCommand>,
    pub frames: mpsc::Sender<Result<Bytes, SynthesisError>>,
}

impl SynthesisSession {
    /// Create a session wired to a [`SynthesisBackend`] that a provider task
    /// (or a test double) drives.
    pub fn channel(capacity: usize) -> (SynthesisSession, SynthesisBackend) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (frame_tx, frame_rx) = mpsc::channel(capacity);
        (
            SynthesisSession {
                input: SynthesisInput { tx: cmd_tx },
                output: SynthesisOutput {
                    rx: frame_rx,
                    _io_task: None,
                },
            },
            SynthesisBackend {
                commands: cmd_rx,
                frames: frame_tx,
            },
        )
    }

    /// Tie the lifetime of the provider IO task to the output half
    pub fn with_io_task(mut self, task: tokio::task::JoinHandle<()>) -> Self {
        self.output._io_task = Some(AbortOnDropHandle::new(task));
        self
    }
}

#[async_trait]
pub trait RealtimeSynthesizer: Send + Sync {
    /// Open a new streaming session
    async fn open(&self) -> Result<SynthesisSession, SynthesisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_session_roundtrip() {
        let (session, mut backend) = SynthesisSession::channel(4);
        session.input.append("hello").await.unwrap();
        session.input.finish().await.unwrap();

        assert_eq!(
            backend.commands.recv().await,
            Some(SynthesisCommand::Append("hello".to_string()))
        );
        assert_eq!(backend.commands.recv().await, Some(SynthesisCommand::Finish));

        backend.frames.send(Ok(Bytes::from_static(b"pcm"))).await.unwrap();
        drop(backend);

        let mut output = session.output;
        assert_eq!(output.next_frame().await.unwrap().unwrap(), Bytes::from_static(b"pcm"));
        assert!(output.next_frame().await.is_none());
    }

    #[tokio::test]
    async fn test_append_after_backend_dropped() {
        let (session, backend) = SynthesisSession::channel(1);
        drop(backend);
        assert!(matches!(
            session.input.append("x").await,
            Err(SynthesisError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_dropping_output_aborts_io_task() {
        let (session, _backend) = SynthesisSession::channel(1);
        let (alive_tx, mut alive_rx) = mpsc::channel::<()>(1);
        let task = tokio::spawn(async move {
            let _alive = alive_tx;
            std::future::pending::<()>().await;
        });
        let session = session.with_io_task(task);
        drop(session);
        assert!(alive_rx.recv().await.is_none());
    }
}

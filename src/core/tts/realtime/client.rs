//! WebSocket client for the realtime TTS protocol.
//!
//! Each [`RealtimeSynthesizer::open`] call opens one provider connection and
//! spawns an IO task that forwards text commands out and PCM frames back. The
//! task is owned by the returned [`SynthesisOutput`](crate::core::tts::SynthesisOutput)
//! and aborted when it is dropped, so a cancelled turn never leaves a live
//! connection behind.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use http::HeaderValue;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::config::RealtimeTtsConfig;
use super::messages::{ClientEvent, OutboundEvent, ServerEvent, decode_audio_delta};
use crate::core::tts::{
    RealtimeSynthesizer, SESSION_CHANNEL_CAPACITY, SynthesisBackend, SynthesisCommand,
    SynthesisError, SynthesisSession,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct RealtimeTtsClient {
    config: RealtimeTtsConfig,
}

impl RealtimeTtsClient {
    pub fn new(config: RealtimeTtsConfig) -> Result<Self, SynthesisError> {
        config.validate().map_err(SynthesisError::ConnectionFailed)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RealtimeTtsConfig {
        &self.config
    }

    async fn connect(&self) -> Result<WsStream, SynthesisError> {
        let url = self.config.ws_url().map_err(SynthesisError::ConnectionFailed)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SynthesisError::ConnectionFailed(e.to_string()))?;

        if let Some(ref key) = self.config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| SynthesisError::ConnectionFailed(format!("Invalid API key: {e}")))?;
            request.headers_mut().insert(http::header::AUTHORIZATION, value);
        }

        let connect = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                SynthesisError::ConnectionFailed(format!(
                    "Connection timed out after {:?}",
                    self.config.connect_timeout
                ))
            })?
            .map_err(|e| match e {
                tungstenite::Error::Http(response)
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    SynthesisError::AuthenticationFailed(format!(
                        "Handshake rejected with {}",
                        response.status()
                    ))
                }
                other => SynthesisError::ConnectionFailed(other.to_string()),
            })?;

        info!(voice = %self.config.voice, "Connected to realtime TTS");
        Ok(ws_stream)
    }
}

#[async_trait]
impl RealtimeSynthesizer for RealtimeTtsClient {
    async fn open(&self) -> Result<SynthesisSession, SynthesisError> {
        let mut ws_stream = self.connect().await?;

        let mut ids = EventIds::default();
        send_event(
            &mut ws_stream,
            &mut ids,
            ClientEvent::SessionUpdate {
                session: self.config.session_settings(),
            },
        )
        .await?;

        let (session, backend) = SynthesisSession::channel(SESSION_CHANNEL_CAPACITY);
        let task = tokio::spawn(run_connection(ws_stream, backend, ids));
        Ok(session.with_io_task(task))
    }
}

/// Generates `event_<millis>_<n>` identifiers
#[derive(Debug, Default)]
struct EventIds {
    counter: u64,
}

impl EventIds {
    fn next_id(&mut self) -> String {
        self.counter += 1;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        format!("event_{millis}_{}", self.counter)
    }
}

async fn send_event<S>(sink: &mut S, ids: &mut EventIds, event: ClientEvent) -> Result<(), SynthesisError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let outbound = OutboundEvent {
        event_id: ids.next_id(),
        event,
    };
    let json = serde_json::to_string(&outbound)
        .map_err(|e| SynthesisError::ProtocolError(format!("Failed to serialize event: {e}")))?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| SynthesisError::ConnectionFailed(format!("Failed to send event: {e}")))
}

/// What the read side decided after one server message
enum Flow {
    Continue,
    Finished,
    Failed(SynthesisError),
}

fn handle_server_text(text: &str) -> (Option<bytes::Bytes>, Flow) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            warn!("Failed to parse TTS server event: {}", e);
            return (None, Flow::Continue);
        }
    };

    match event {
        ServerEvent::AudioDelta { delta } => match decode_audio_delta(&delta) {
            Ok(pcm) if pcm.is_empty() => (None, Flow::Continue),
            Ok(pcm) => (Some(pcm), Flow::Continue),
            Err(e) => (
                None,
                Flow::Failed(SynthesisError::ProtocolError(format!(
                    "Invalid base64 audio delta: {e}"
                ))),
            ),
        },
        ServerEvent::SessionFinished => (None, Flow::Finished),
        ServerEvent::Error { error } => {
            let message = error.describe();
            let err = if error.is_auth_failure() {
                SynthesisError::AuthenticationFailed(message)
            } else {
                SynthesisError::ProviderError(message)
            };
            (None, Flow::Failed(err))
        }
        ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
            debug!("TTS session configured");
            (None, Flow::Continue)
        }
        ServerEvent::AudioDone | ServerEvent::ResponseDone | ServerEvent::Unknown => {
            (None, Flow::Continue)
        }
    }
}

async fn run_connection(ws_stream: WsStream, backend: SynthesisBackend, mut ids: EventIds) {
    let (mut ws_sink, mut ws_read) = ws_stream.split();
    let SynthesisBackend {
        mut commands,
        frames,
    } = backend;
    let mut finish_sent = false;
    let mut frames_forwarded: u64 = 0;

    loop {
        tokio::select! {
            command = commands.recv(), if !finish_sent => {
                let event = match command {
                    Some(SynthesisCommand::Append(text)) => ClientEvent::AppendText { text },
                    Some(SynthesisCommand::Finish) => {
                        finish_sent = true;
                        ClientEvent::SessionFinish
                    }
                    None => {
                        debug!("Synthesis input dropped before finish, closing connection");
                        break;
                    }
                };
                if let Err(e) = send_event(&mut ws_sink, &mut ids, event).await {
                    error!("Failed to send TTS event: {}", e);
                    let _ = frames.send(Err(e)).await;
                    break;
                }
            }

            message = ws_read.next() => {
                let (pcm, flow) = match message {
                    Some(Ok(Message::Text(text))) => handle_server_text(&text),
                    Some(Ok(Message::Binary(data))) => (Some(data), Flow::Continue),
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                        }
                        (None, Flow::Continue)
                    }
                    Some(Ok(Message::Close(_))) | None => (
                        None,
                        Flow::Failed(SynthesisError::ConnectionFailed(
                            "Connection closed before session finished".to_string(),
                        )),
                    ),
                    Some(Ok(_)) => (None, Flow::Continue),
                    Some(Err(e)) => (
                        None,
                        Flow::Failed(SynthesisError::ConnectionFailed(e.to_string())),
                    ),
                };

                if let Some(pcm) = pcm {
                    frames_forwarded += 1;
                    if frames.send(Ok(pcm)).await.is_err() {
                        debug!("Synthesis output dropped, closing connection");
                        break;
                    }
                }

                match flow {
                    Flow::Continue => {}
                    Flow::Finished => {
                        info!(frames = frames_forwarded, "TTS session finished");
                        break;
                    }
                    Flow::Failed(e) => {
                        error!("TTS session failed: {}", e);
                        let _ = frames.send(Err(e)).await;
                        break;
                    }
                }
            }
        }
    }

    let _ = ws_sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_unique() {
        let mut ids = EventIds::default();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("event_"));
    }

    #[test]
    fn test_handle_server_text() {
        let (pcm, flow) = handle_server_text(r#"{"type":"response.audio.delta","delta":"AQI="}"#);
        assert_eq!(pcm.unwrap().as_ref(), &[1, 2]);
        assert!(matches!(flow, Flow::Continue));

        let (pcm, flow) = handle_server_text(r#"{"type":"session.finished"}"#);
        assert!(pcm.is_none());
        assert!(matches!(flow, Flow::Finished));

        let (_, flow) =
            handle_server_text(r#"{"type":"error","error":{"code":"InvalidApiKey","message":"x"}}"#);
        assert!(matches!(
            flow,
            Flow::Failed(SynthesisError::AuthenticationFailed(_))
        ));

        let (_, flow) = handle_server_text(r#"{"type":"response.audio.delta","delta":"!!"}"#);
        assert!(matches!(flow, Flow::Failed(SynthesisError::ProtocolError(_))));
    }

    #[test]
    fn test_new_validates_config() {
        let config = RealtimeTtsConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(RealtimeTtsClient::new(config).is_err());
    }
}

//! End-to-end tests over a real listener: routing, auth, connection limits
//! and the conversation WebSocket protocol.

mod mock_providers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use duplex_gateway::config::AuthApiSecret;
use duplex_gateway::session::WireProfile;
use duplex_gateway::{ServerConfig, routes, state::AppState};

use mock_providers::*;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.rate_limit_requests_per_second = 100000;
    config.max_connections_per_ip = 1000;
    config
}

async fn spawn_server(config: ServerConfig, chat: Arc<ScriptedChat>) -> (SocketAddr, Arc<AppState>) {
    spawn_server_with(config, ScriptedTranscriber::replying("hello gateway"), chat).await
}

async fn spawn_server_with(
    config: ServerConfig,
    transcriber: Arc<ScriptedTranscriber>,
    chat: Arc<ScriptedChat>,
) -> (SocketAddr, Arc<AppState>) {
    let deps = deps(
        transcriber,
        chat,
        ScriptedSynthesizer::pcm(),
        Some(RecordingStore::new()),
        test_settings(),
    );
    let state = AppState::with_dependencies(config, deps);
    let app = routes::create_app_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state)
}

async fn connect(url: String) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as (event name, payload) in the keyed wire profile
async fn next_keyed(ws: &mut Client) -> (String, Value) {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for server event")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(&text).unwrap();
            let object = value.as_object().unwrap();
            assert_eq!(object.len(), 1, "keyed frames carry one key: {value}");
            let (name, payload) = object.iter().next().unwrap();
            return (name.clone(), payload.clone());
        }
    }
}

async fn read_until(ws: &mut Client, name: &str) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    loop {
        let event = next_keyed(ws).await;
        let done = event.0 == name;
        events.push(event);
        if done {
            return events;
        }
    }
}

fn audio_packet(seq: u32, total: u32, data: &[u8]) -> Value {
    json!({ "seq": seq, "total": total, "data": BASE64_STANDARD.encode(data) })
}

// =============================================================================
// REST
// =============================================================================

#[tokio::test]
async fn test_health_and_sessions_endpoints() {
    let (addr, _state) = spawn_server(test_config(), ScriptedChat::replying(&["Hi."])).await;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("http://{addr}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health, json!({ "status": "OK" }));

    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;
    let (name, payload) = next_keyed(&mut ws).await;
    assert_eq!(name, "connected");
    let session_id = payload["session_id"].as_str().unwrap().to_string();

    let list: Value = http
        .get(format!("http://{addr}/v1/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["sessions"][0]["session_id"], session_id.as_str());

    let response = http
        .get(format!("http://{addr}/v1/sessions/{session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let snapshot: Value = response.json().await.unwrap();
    assert_eq!(snapshot["turn"], 0);

    let response = http
        .get(format!("http://{addr}/v1/sessions/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

// =============================================================================
// Conversation protocol
// =============================================================================

#[tokio::test]
async fn test_audio_conversation_over_websocket() {
    let (addr, state) = spawn_server(
        test_config(),
        ScriptedChat::replying(&["Hello!", " Nice to meet you."]),
    )
    .await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;

    let (name, payload) = next_keyed(&mut ws).await;
    assert_eq!(name, "connected");
    assert_eq!(payload["message"], "audio connection established");

    send_json(&mut ws, audio_packet(2, 2, b"world")).await;
    let (name, ack) = next_keyed(&mut ws).await;
    assert_eq!(name, "packet_ack");
    assert_eq!(ack, json!({ "seq": 2, "received": 1, "total": 2 }));

    send_json(&mut ws, audio_packet(1, 2, b"hello ")).await;
    let events = read_until(&mut ws, "audio_complete").await;
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();

    assert_eq!(names[0], "packet_ack");
    assert_eq!(names[1], "transcription_started");
    assert_eq!(names[2], "chat_started");
    assert_eq!(events[2].1["user_message"], "hello gateway");
    assert!(names.contains(&"tts_started"));
    assert!(names.contains(&"chat_chunk"));
    assert!(!names.contains(&"error"));

    let audio: Vec<&Value> = events
        .iter()
        .filter(|(n, p)| n == "audio_stream" && p["event"] == "data")
        .map(|(_, p)| p)
        .collect();
    assert!(!audio.is_empty());
    for (i, chunk) in audio.iter().enumerate() {
        assert_eq!(chunk["seq"], i as u64);
        assert_eq!(chunk["format"], "wav");
        let wav = BASE64_STANDARD.decode(chunk["data"].as_str().unwrap()).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
    }
    let finished = events
        .iter()
        .find(|(n, p)| n == "audio_stream" && p["event"] == "finished")
        .expect("audio finished marker");
    assert_eq!(finished.1["chunks"], audio.len() as u64);

    let (_, complete) = events
        .iter()
        .find(|(n, _)| n == "chat_tts_complete")
        .expect("chat_tts_complete");
    assert_eq!(complete["assistant_response"], "Hello! Nice to meet you.");
    assert_eq!(complete["tts_success"], true);
    assert_eq!(complete["segments_count"], 2);
    assert_eq!(complete["total_segments"], 2);
    assert_eq!(complete["db_saved"], true);

    let (_, summary) = events.last().unwrap();
    assert_eq!(summary["packets"], 2);
    assert_eq!(summary["audio_size"], 11);

    ws.close(None).await.unwrap();
    for _ in 0..100 {
        if state.sessions.is_empty() && state.ws_connection_count() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session and connection slot were not released on close");
}

#[tokio::test]
async fn test_idle_timer_waits_for_running_turn() {
    let mut config = test_config();
    config.pipeline.idle_timeout_seconds = 1;
    let (addr, _state) = spawn_server_with(
        config,
        ScriptedTranscriber::slow("hello gateway", Duration::from_millis(2500)),
        ScriptedChat::replying(&["Hi."]),
    )
    .await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;
    assert_eq!(next_keyed(&mut ws).await.0, "connected");

    send_json(&mut ws, audio_packet(1, 1, b"pcm")).await;
    let events = read_until(&mut ws, "audio_complete").await;
    assert!(
        !events.iter().any(|(name, _)| name == "error"),
        "turn was interrupted: {events:?}"
    );

    // with the turn finished the quiet connection is closed
    let (name, payload) = next_keyed(&mut ws).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], "idle_timeout");
}

#[tokio::test]
async fn test_vlm_conversation_uses_prefixed_events() {
    let (addr, _state) = spawn_server(test_config(), ScriptedChat::replying(&["A cat."])).await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/vlm")).await;
    let (name, payload) = next_keyed(&mut ws).await;
    assert_eq!(name, "connected");
    assert_eq!(payload["message"], "vlm connection established");

    send_json(
        &mut ws,
        json!({ "type": "image", "seq": 1, "total": 1, "data": BASE64_STANDARD.encode([0x89, b'P', b'N', b'G']) }),
    )
    .await;
    let (_, ack) = next_keyed(&mut ws).await;
    assert_eq!(ack["type"], "image");

    send_json(
        &mut ws,
        json!({ "type": "audio", "seq": 1, "total": 1, "data": BASE64_STANDARD.encode(b"pcm") }),
    )
    .await;
    let (_, ack) = next_keyed(&mut ws).await;
    assert_eq!(ack["type"], "audio");

    send_json(&mut ws, json!({ "type": "end" })).await;
    let events = read_until(&mut ws, "vlm_complete").await;
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert!(names.contains(&"vlm_chat_started"));
    assert!(names.contains(&"vlm_chat_chunk"));
    assert!(names.contains(&"vlm_chat_tts_complete"));
    assert!(!names.contains(&"chat_started"));

    let (_, summary) = events.last().unwrap();
    assert_eq!(summary["image_size"], 4);
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_open() {
    let (addr, _state) = spawn_server(test_config(), ScriptedChat::replying(&["Hi."])).await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;
    next_keyed(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let (name, payload) = next_keyed(&mut ws).await;
    assert_eq!(name, "error");
    assert_eq!(payload["code"], "malformed_packet");

    send_json(&mut ws, json!({ "seq": 1, "total": 2, "data": "***" })).await;
    let (_, payload) = next_keyed(&mut ws).await;
    assert_eq!(payload["code"], "malformed_packet");

    send_json(&mut ws, audio_packet(3, 2, b"x")).await;
    let (_, payload) = next_keyed(&mut ws).await;
    assert_eq!(payload["code"], "out_of_range");

    let oversized = vec![0u8; 8 * 1024 + 1];
    send_json(&mut ws, audio_packet(1, 2, &oversized)).await;
    let (_, payload) = next_keyed(&mut ws).await;
    assert_eq!(payload["code"], "oversized_packet");

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let (_, payload) = next_keyed(&mut ws).await;
    assert_eq!(payload["code"], "malformed_packet");

    // the session still accepts a full upload afterwards
    send_json(&mut ws, audio_packet(1, 1, b"ok")).await;
    let events = read_until(&mut ws, "audio_complete").await;
    assert!(!events.iter().any(|(n, _)| n == "error"));
}

#[tokio::test]
async fn test_client_cancel_reports_cancelled() {
    let (addr, _state) = spawn_server(
        test_config(),
        ScriptedChat::new(ChatScript::Hang(vec!["Still thinking".to_string()])),
    )
    .await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;
    next_keyed(&mut ws).await;

    send_json(&mut ws, audio_packet(1, 1, b"pcm")).await;
    read_until(&mut ws, "chat_chunk").await;
    send_json(&mut ws, json!({ "type": "cancel" })).await;

    let events = read_until(&mut ws, "error").await;
    assert_eq!(events.last().unwrap().1["code"], "cancelled");
}

#[tokio::test]
async fn test_envelope_wire_profile() {
    let mut config = test_config();
    config.pipeline.wire_profile = WireProfile::Envelope;
    let (addr, _state) = spawn_server(config, ScriptedChat::replying(&["Hi."])).await;
    let mut ws = connect(format!("ws://{addr}/v1/chat/audio")).await;

    let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: Value = serde_json::from_str(message.to_text().unwrap()).unwrap();
    assert_eq!(value["event_type"], "connected");
    assert!(value["data"]["session_id"].is_string());
}

// =============================================================================
// Auth and connection limits
// =============================================================================

#[tokio::test]
async fn test_auth_required_for_api_and_websocket() {
    let mut config = test_config();
    config.auth_required = true;
    config.auth_api_secrets = vec![AuthApiSecret {
        id: "mobile".to_string(),
        secret: "s3cret".to_string(),
    }];
    let (addr, _state) = spawn_server(config, ScriptedChat::replying(&["Hi."])).await;
    let http = reqwest::Client::new();

    // health stays public
    let response = http.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(response.status(), 200);

    let response = http
        .get(format!("http://{addr}/v1/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = http
        .get(format!("http://{addr}/v1/sessions"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = http
        .get(format!("http://{addr}/v1/sessions"))
        .bearer_auth("s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let rejected = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/chat/audio")).await;
    assert!(rejected.is_err());

    let mut ws = connect(format!("ws://{addr}/v1/chat/audio?token=s3cret")).await;
    let (name, _) = next_keyed(&mut ws).await;
    assert_eq!(name, "connected");
}

#[tokio::test]
async fn test_per_ip_connection_limit() {
    let mut config = test_config();
    config.max_connections_per_ip = 1;
    let (addr, state) = spawn_server(config, ScriptedChat::replying(&["Hi."])).await;

    let mut first = connect(format!("ws://{addr}/v1/chat/audio")).await;
    next_keyed(&mut first).await;
    assert_eq!(state.ws_connection_count(), 1);

    match tokio_tungstenite::connect_async(format!("ws://{addr}/v1/chat/audio")).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 429)
        }
        other => panic!("expected 429 rejection, got {:?}", other.map(|_| ())),
    }

    first.close(None).await.unwrap();
    for _ in 0..100 {
        if state.ws_connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut again = connect(format!("ws://{addr}/v1/chat/audio")).await;
    let (name, _) = next_keyed(&mut again).await;
    assert_eq!(name, "connected");
}

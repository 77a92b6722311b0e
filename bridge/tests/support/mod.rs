//! Bridge test harness
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chorus_bridge::{router, BridgeState};
use chorus_core::{
    Chorus, ChorusConfig, SpeechSynthesizer, StaticVoiceCatalog, SynthesisError, VoiceSelection,
};
use futures_util::StreamExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Returns the request text itself as the audio bytes
pub struct EchoSynthesizer;

#[async_trait]
impl SpeechSynthesizer for EchoSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceSelection,
    ) -> Result<String, SynthesisError> {
        Ok(format!("data:audio/mp3;base64,{}", STANDARD.encode(text)))
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub chorus: Chorus,
    pub state: BridgeState,
    _dir: TempDir,
    _handle: tokio::task::JoinHandle<()>,
}

/// Start the bridge on an ephemeral localhost port
pub async fn start_test_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = ChorusConfig::default();
    config.blob_dir = dir.path().to_path_buf();
    config.stall_timeout = None;
    config.default_voices = vec![VoiceSelection::new("id_001", "google")];

    let catalog = Arc::new(StaticVoiceCatalog::from_config(&config));
    let chorus = Chorus::new(config, Arc::new(EchoSynthesizer), catalog)
        .await
        .expect("start chorus");
    let state = BridgeState::new(&chorus);

    let listener = TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().unwrap();
    let server_state = state.clone();
    let handle = tokio::spawn(async move {
        chorus_bridge::serve(listener, server_state, std::future::pending())
            .await
            .expect("server exited cleanly");
    });

    TestServer {
        addr,
        chorus,
        state,
        _dir: dir,
        _handle: handle,
    }
}

impl TestServer {
    /// Open an avatar socket and wait until the registry knows about it
    pub async fn connect(&self, avatar_id: &str) -> Client {
        let before = self.state.registry.connections_for(avatar_id);
        let url = format!("ws://{}/ws/tts?avatarId={}", self.addr, avatar_id);
        let (client, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("websocket handshake");
        wait_until(|| self.state.registry.connections_for(avatar_id) > before).await;
        client
    }

    /// Send a request through the router without going over the network
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        router(self.state.clone())
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    pub async fn post_update(&self, body: Value) -> Value {
        let response = self
            .request(
                Request::builder()
                    .method("POST")
                    .uri("/update")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await;
        assert!(response.status().is_success());
        body_json(response).await
    }
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body")
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

/// Next text frame as JSON, failing after two seconds
pub async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

/// True when no text frame arrives within `wait`
pub async fn stays_silent(client: &mut Client, wait: Duration) -> bool {
    match tokio::time::timeout(wait, client.next()).await {
        Err(_) => true,
        Ok(Some(Ok(Message::Text(_)))) => false,
        Ok(_) => true,
    }
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

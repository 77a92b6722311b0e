//! Avatar WebSocket connections.
//!
//! Each upgraded socket is registered under its `avatarId` and served by two
//! tasks: a writer draining the registry channel into text frames, and a
//! reader that turns `avatar_finished` frames into dispatcher completions.
//! Whichever side ends first tears the other down, and the connection is
//! unregistered afterwards.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chorus_core::{ClientMessage, SpeechDispatcher};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::BridgeState;

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "avatarId")]
    pub avatar_id: Option<String>,
}

pub async fn ws_handler(
    State(state): State<BridgeState>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let avatar_id = query
        .avatar_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());
    let Some(avatar_id) = avatar_id else {
        warn!(target: "bridge", "Rejected avatar connection without avatarId");
        return (StatusCode::BAD_REQUEST, "avatarId query parameter is required").into_response();
    };

    ws.on_upgrade(move |socket| serve_connection(socket, avatar_id, state))
}

async fn serve_connection(socket: WebSocket, avatar_id: String, state: BridgeState) {
    let (tx, mut rx) = mpsc::channel::<Value>(state.connection_buffer);
    let conn_id = state.registry.register(&avatar_id, tx);
    info!(target: "bridge", avatar_id = %avatar_id, conn = %conn_id, "Avatar connected");

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(target: "bridge", error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let dispatcher = Arc::clone(&state.dispatcher);
    let reader_avatar = avatar_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    handle_client_text(&dispatcher, &reader_avatar, &text).await
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(target: "bridge", avatar_id = %reader_avatar, error = %e, "Socket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    state.registry.unregister(conn_id);
    info!(target: "bridge", avatar_id = %avatar_id, conn = %conn_id, "Avatar disconnected");
}

async fn handle_client_text(dispatcher: &SpeechDispatcher, avatar_id: &str, text: &str) {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Finished { artifact_url }) => {
            match dispatcher.complete_url(&artifact_url).await {
                Ok(true) => {
                    debug!(target: "bridge", avatar_id, artifact = %artifact_url, "Playback finished")
                }
                Ok(false) => {
                    debug!(target: "bridge", avatar_id, artifact = %artifact_url, "Finished signal did not match the item in flight")
                }
                Err(e) => {
                    warn!(target: "bridge", avatar_id, error = %e, "Rejected finished signal")
                }
            }
        }
        Ok(ClientMessage::Other) => {
            debug!(target: "bridge", avatar_id, "Ignoring client message");
        }
        Err(e) => {
            warn!(target: "bridge", avatar_id, error = %e, "Malformed client message");
        }
    }
}

//! JSON messages exchanged with avatar clients and the update endpoint.

use crate::blob::ArtifactRef;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SIGNAL_FIELD: &str = "signal";
pub const AUDIO_FIELD: &str = "avatar_audio";

/// Directive carried in the `signal` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    /// server → client: play the attached audio
    AvatarSpeak,
    /// client → server: playback of `avatar_audio` is done
    AvatarFinished,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::AvatarSpeak => "avatar_speak",
            Signal::AvatarFinished => "avatar_finished",
        }
    }
}

/// Message received from an avatar connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Finished { artifact_url: String },
    Other,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        let signal = value.get(SIGNAL_FIELD).and_then(Value::as_str);
        let audio = value.get(AUDIO_FIELD).and_then(Value::as_str);
        Ok(match (signal, audio) {
            (Some(s), Some(url)) if s == Signal::AvatarFinished.as_str() => ClientMessage::Finished {
                artifact_url: url.to_string(),
            },
            _ => ClientMessage::Other,
        })
    }
}

/// Event types routed through `SpeechDispatcher::intercept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    SpeakRequest,
    Clear,
    Other,
}

impl UpdateKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "tts" | "speak-request" => UpdateKind::SpeakRequest,
            "clear_tts" | "clear" => UpdateKind::Clear,
            _ => UpdateKind::Other,
        }
    }
}

/// Body of an update posted by the control surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Build the dispatch message: the original request plus audio URL and
/// speak directive. The request payload itself is left untouched.
pub fn speak_message(payload: &Map<String, Value>, artifact: &ArtifactRef) -> Value {
    let mut message = payload.clone();
    message.insert(AUDIO_FIELD.to_string(), Value::String(artifact.url()));
    message.insert(
        SIGNAL_FIELD.to_string(),
        Value::String(Signal::AvatarSpeak.as_str().to_string()),
    );
    Value::Object(message)
}

/// Text to synthesize: `content.sanitized`, then `content.text`, then `text`
pub fn extract_text(payload: &Map<String, Value>) -> Option<String> {
    let content = payload.get("content");
    content
        .and_then(|c| c.get("sanitized"))
        .and_then(Value::as_str)
        .or_else(|| content.and_then(|c| c.get("text")).and_then(Value::as_str))
        .or_else(|| payload.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

use super::{SpeechSynthesizer, SynthesisError, VoiceSelection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    voice_provider: &'a str,
}

#[derive(Deserialize)]
struct TtsResponse {
    #[serde(default)]
    audio: Option<String>,
}

/// Client for a TTS service answering `POST {text, voice_id, voice_provider}`
/// with `{"audio": "<base64>"}`
#[derive(Clone, Debug)]
pub struct HttpSynthesizer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSynthesizer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, SynthesisError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SynthesisError::Upstream(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    #[tracing::instrument(skip(self, text), fields(voice = %voice.voice_id, provider = %voice.provider, chars = text.len()))]
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSelection,
    ) -> Result<String, SynthesisError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&TtsRequest {
                text,
                voice_id: &voice.voice_id,
                voice_provider: &voice.provider,
            })
            .send()
            .await
            .map_err(|e| SynthesisError::Upstream(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(target: "synthesis", %status, body = %body.trim(), "TTS service rejected request");
            return Err(if status == reqwest::StatusCode::BAD_REQUEST {
                SynthesisError::InvalidVoice(body.trim().to_string())
            } else {
                SynthesisError::Upstream(format!("status {}: {}", status, body.trim()))
            });
        }

        let parsed: TtsResponse = resp
            .json()
            .await
            .map_err(|e| SynthesisError::Upstream(format!("invalid response body: {}", e)))?;
        let audio = parsed.audio.filter(|a| !a.is_empty()).ok_or(SynthesisError::EmptyAudio)?;
        debug!(target: "synthesis", encoded_len = audio.len(), "TTS service returned audio");
        Ok(audio)
    }
}

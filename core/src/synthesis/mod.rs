//! Synthesis gateway
//!
//! Turns text plus a voice selection into a playable artifact:
//! - asks the external [`SpeechSynthesizer`] for encoded audio
//! - strips any `data:audio/...;base64,` prefix and decodes the payload
//! - stores the raw bytes in the [`BlobStore`]
//! - files a delayed fallback cleanup so the artifact can never outlive
//!   `artifact_ttl`, even if no completion signal ever arrives
//!
//! Which voices an avatar may speak with comes from a [`VoiceCatalog`];
//! avatar profile storage lives outside this crate.

mod http;

pub use http::HttpSynthesizer;

use crate::blob::{ArtifactRef, BlobStore};
use crate::cleanup::CleanupHandle;
use crate::config::ChorusConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Upstream TTS failure: {0}")]
    Upstream(String),

    #[error("Invalid voice selection: {0}")]
    InvalidVoice(String),

    #[error("Audio decode failed: {0}")]
    Decode(String),

    #[error("Synthesizer returned no audio")]
    EmptyAudio,

    #[error("Artifact storage failed: {0}")]
    Storage(String),
}

/// A provider/voice pair an avatar can speak with
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceSelection {
    pub voice_id: String,
    pub provider: String,
}

impl VoiceSelection {
    pub fn new(voice_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            voice_id: voice_id.into(),
            provider: provider.into(),
        }
    }
}

/// External text-to-speech service
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Return base64 encoded audio, optionally wrapped as a data URL
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSelection,
    ) -> std::result::Result<String, SynthesisError>;
}

/// Source of the voices configured for each avatar
#[async_trait]
pub trait VoiceCatalog: Send + Sync {
    async fn voices(&self, avatar_id: &str) -> Vec<VoiceSelection>;
}

/// Catalog backed by configuration
#[derive(Debug, Clone, Default)]
pub struct StaticVoiceCatalog {
    voices: HashMap<String, Vec<VoiceSelection>>,
    fallback: Vec<VoiceSelection>,
}

impl StaticVoiceCatalog {
    pub fn new(voices: HashMap<String, Vec<VoiceSelection>>, fallback: Vec<VoiceSelection>) -> Self {
        Self { voices, fallback }
    }

    pub fn from_config(config: &ChorusConfig) -> Self {
        Self::new(config.voices.clone(), config.default_voices.clone())
    }

    pub fn with_avatar(mut self, avatar_id: &str, voices: Vec<VoiceSelection>) -> Self {
        self.voices.insert(avatar_id.to_string(), voices);
        self
    }
}

#[async_trait]
impl VoiceCatalog for StaticVoiceCatalog {
    async fn voices(&self, avatar_id: &str) -> Vec<VoiceSelection> {
        match self.voices.get(avatar_id) {
            Some(v) if !v.is_empty() => v.clone(),
            _ => self.fallback.clone(),
        }
    }
}

/// Drop a `data:<mime>;base64,` style prefix if present
pub fn strip_data_url(encoded: &str) -> &str {
    match encoded.find(',') {
        Some(idx) => encoded[idx + 1..].trim(),
        None => encoded.trim(),
    }
}

pub fn decode_audio(encoded: &str) -> std::result::Result<Vec<u8>, SynthesisError> {
    STANDARD
        .decode(strip_data_url(encoded))
        .map_err(|e| SynthesisError::Decode(e.to_string()))
}

pub struct SynthesisGateway {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    store: Arc<BlobStore>,
    cleanup: CleanupHandle,
    artifact_ttl: Duration,
}

impl SynthesisGateway {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<BlobStore>,
        cleanup: CleanupHandle,
        artifact_ttl: Duration,
    ) -> Self {
        Self {
            synthesizer,
            store,
            cleanup,
            artifact_ttl,
        }
    }

    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceSelection,
    ) -> std::result::Result<ArtifactRef, SynthesisError> {
        if voice.voice_id.trim().is_empty() || voice.provider.trim().is_empty() {
            return Err(SynthesisError::InvalidVoice(format!(
                "{}/{}",
                voice.provider, voice.voice_id
            )));
        }

        let encoded = self.synthesizer.synthesize(text, voice).await?;
        let bytes = decode_audio(&encoded)?;
        if bytes.is_empty() {
            return Err(SynthesisError::EmptyAudio);
        }

        let artifact = self
            .store
            .create(&bytes)
            .await
            .map_err(|e| SynthesisError::Storage(e.to_string()))?;
        self.cleanup.delete_after(artifact.clone(), self.artifact_ttl);

        debug!(
            target: "synthesis",
            artifact = %artifact,
            bytes = bytes.len(),
            voice = %voice.voice_id,
            provider = %voice.provider,
            "Stored synthesized audio"
        );
        Ok(artifact)
    }
}

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::selector::DEFAULT_RECENCY_WINDOW;
use crate::synthesis::VoiceSelection;
use crate::{ChorusError, Result};

/// Runtime configuration for the speech coordinator
#[derive(Clone, Debug)]
pub struct ChorusConfig {
    /// Directory holding synthesized artifacts
    pub blob_dir: PathBuf,
    /// Fallback lifetime of an artifact that never gets a completion signal
    pub artifact_ttl: Duration,
    /// How often the cleanup worker sweeps delayed deletions
    pub cleanup_interval: Duration,
    pub cleanup_queue_capacity: usize,
    pub recency_window: usize,
    /// Outbound messages buffered per avatar connection
    pub connection_buffer: usize,
    /// Release a dispatched item that never reports completion. Disabled by default.
    pub stall_timeout: Option<Duration>,
    pub server: ServerConfig,
    pub tts: TtsServiceConfig,
    /// avatar id -> voices it may speak with
    pub voices: HashMap<String, Vec<VoiceSelection>>,
    /// Used for avatars without an entry in `voices`
    pub default_voices: Vec<VoiceSelection>,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// External TTS service reached by `HttpSynthesizer`
#[derive(Clone, Debug)]
pub struct TtsServiceConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("CHORUS_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parse("CHORUS_PORT").unwrap_or(7777),
        }
    }
}

impl Default for TtsServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: std::env::var("CHORUS_TTS_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://127.0.0.1:7778/tts-service".to_string()),
            timeout_ms: env_parse("CHORUS_TTS_TIMEOUT_MS").unwrap_or(20_000),
        }
    }
}

impl Default for ChorusConfig {
    fn default() -> Self {
        Self {
            blob_dir: std::env::var("CHORUS_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("tts_blobs")),
            artifact_ttl: Duration::from_secs(env_parse("CHORUS_ARTIFACT_TTL_SECS").unwrap_or(300)),
            cleanup_interval: Duration::from_secs(
                env_parse::<u64>("CHORUS_CLEANUP_INTERVAL_SECS")
                    .unwrap_or(10)
                    .max(1),
            ),
            cleanup_queue_capacity: env_parse("CHORUS_CLEANUP_QUEUE").unwrap_or(256),
            recency_window: env_parse("CHORUS_RECENCY_WINDOW").unwrap_or(DEFAULT_RECENCY_WINDOW),
            connection_buffer: env_parse("CHORUS_CONNECTION_BUFFER").unwrap_or(64),
            stall_timeout: env_parse::<u64>("CHORUS_STALL_TIMEOUT_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            server: ServerConfig::default(),
            tts: TtsServiceConfig::default(),
            voices: HashMap::new(),
            default_voices: Vec::new(),
        }
    }
}

impl ChorusConfig {
    /// Defaults (env-aware) overlaid with a TOML file from `CHORUS_CONFIG`
    /// or `./chorus.toml` when present.
    pub fn load() -> Self {
        let path = std::env::var("CHORUS_CONFIG").unwrap_or_else(|_| "chorus.toml".into());
        Self::load_from(path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let default = Self::default();
        let p = path.as_ref();
        if !p.exists() {
            tracing::info!(target: "config", path = %p.display(), "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match toml::from_str::<ChorusToml>(&s) {
                Ok(t) => t.overlay(default),
                Err(e) => {
                    tracing::warn!(target: "config", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "config", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    /// Strict variant used where a malformed file must be reported
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let t: ChorusToml = toml::from_str(s).map_err(|e| ChorusError::Config(e.to_string()))?;
        Ok(t.overlay(Self::default()))
    }
}

// =========================
// TOML overlay definitions
// =========================

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ChorusToml {
    pub blob_dir: Option<PathBuf>,
    pub artifact_ttl_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    pub cleanup_queue_capacity: Option<usize>,
    pub recency_window: Option<usize>,
    pub connection_buffer: Option<usize>,
    pub stall_timeout_ms: Option<u64>,
    pub server: Option<ServerToml>,
    pub tts: Option<TtsToml>,
    pub voices: Option<HashMap<String, Vec<VoiceSelection>>>,
    pub default_voices: Option<Vec<VoiceSelection>>,
}

impl ChorusToml {
    fn overlay(self, mut base: ChorusConfig) -> ChorusConfig {
        if let Some(x) = self.blob_dir {
            base.blob_dir = x;
        }
        if let Some(x) = self.artifact_ttl_secs {
            base.artifact_ttl = Duration::from_secs(x);
        }
        if let Some(x) = self.cleanup_interval_secs {
            base.cleanup_interval = Duration::from_secs(x.max(1));
        }
        if let Some(x) = self.cleanup_queue_capacity {
            base.cleanup_queue_capacity = x.max(1);
        }
        if let Some(x) = self.recency_window {
            base.recency_window = x;
        }
        if let Some(x) = self.connection_buffer {
            base.connection_buffer = x.max(1);
        }
        if let Some(x) = self.stall_timeout_ms {
            // 0 switches the watchdog off
            base.stall_timeout = (x > 0).then(|| Duration::from_millis(x));
        }
        if let Some(s) = self.server {
            s.apply(&mut base.server);
        }
        if let Some(t) = self.tts {
            t.apply(&mut base.tts);
        }
        if let Some(v) = self.voices {
            base.voices = v;
        }
        if let Some(v) = self.default_voices {
            base.default_voices = v;
        }
        base
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct ServerToml {
    pub host: Option<String>,
    pub port: Option<u16>,
}
impl ServerToml {
    fn apply(self, s: &mut ServerConfig) {
        if let Some(x) = self.host {
            s.host = x;
        }
        if let Some(x) = self.port {
            s.port = x;
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct TtsToml {
    pub endpoint: Option<String>,
    pub timeout_ms: Option<u64>,
}
impl TtsToml {
    fn apply(self, t: &mut TtsServiceConfig) {
        if let Some(x) = self.endpoint {
            t.endpoint = x;
        }
        if let Some(x) = self.timeout_ms {
            t.timeout_ms = x;
        }
    }
}

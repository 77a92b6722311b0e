//! Temporary audio artifact storage.
//!
//! Artifacts are written under a single directory with random, URL-safe
//! names (`tts_<uuid>.mp3`). Callers only ever hold an [`ArtifactRef`]; the
//! file path is derived from it on demand. Deletion is idempotent: the
//! completion signal, a queue clear and the fallback timer may all race to
//! delete the same artifact.

use crate::{ChorusError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Route prefix under which artifacts are served to avatar clients
pub const ARTIFACT_ROUTE: &str = "/tts-blob";

const ARTIFACT_PREFIX: &str = "tts_";
const ARTIFACT_EXT: &str = ".mp3";
const MAX_NAME_LEN: usize = 128;

/// Opaque reference to a stored artifact (its file name)
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactRef(String);

impl ArtifactRef {
    /// Validate a bare artifact name. Anything that could escape the blob
    /// directory is rejected.
    pub fn parse(name: &str) -> Result<Self> {
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && !name.starts_with('.')
            && !name.contains("..")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(ChorusError::InvalidArtifact(name.to_string()))
        }
    }

    /// Recover the reference from a URL a client echoed back, e.g.
    /// `/tts-blob/tts_ab12.mp3` or a full `http://host/tts-blob/...` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        let path = url.split(['?', '#']).next().unwrap_or_default();
        let name = path.rsplit('/').next().unwrap_or_default();
        Self::parse(name)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Path clients use to fetch the artifact
    pub fn url(&self) -> String {
        format!("{}/{}", ARTIFACT_ROUTE, self.0)
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = ChorusError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ArtifactRef> for String {
    fn from(value: ArtifactRef) -> Self {
        value.0
    }
}

/// Directory-backed store for synthesized audio
#[derive(Debug)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) the artifact directory
    pub async fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        debug!(target: "blob_store", dir = %dir.display(), "Blob store ready");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, artifact: &ArtifactRef) -> PathBuf {
        self.dir.join(artifact.name())
    }

    pub fn exists(&self, artifact: &ArtifactRef) -> bool {
        self.path_of(artifact).is_file()
    }

    /// Write `bytes` to a fresh uniquely-named artifact
    pub async fn create(&self, bytes: &[u8]) -> Result<ArtifactRef> {
        let name = format!(
            "{}{}{}",
            ARTIFACT_PREFIX,
            uuid::Uuid::new_v4().simple(),
            ARTIFACT_EXT
        );
        let artifact = ArtifactRef::parse(&name)?;
        let path = self.path_of(&artifact);

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.into());
        }

        debug!(target: "blob_store", artifact = %artifact, bytes = bytes.len(), "Artifact created");
        Ok(artifact)
    }

    /// Delete an artifact. Returns `Ok(false)` when it was already gone.
    pub async fn delete(&self, artifact: &ArtifactRef) -> Result<bool> {
        removal(artifact, tokio::fs::remove_file(self.path_of(artifact)).await)
    }

    /// Blocking variant for the inline path taken when the cleanup queue
    /// cannot accept a job.
    pub fn delete_blocking(&self, artifact: &ArtifactRef) -> Result<bool> {
        removal(artifact, std::fs::remove_file(self.path_of(artifact)))
    }

    /// Remove artifacts left behind by an earlier process. Nothing in the
    /// store survives a restart.
    pub async fn purge_stale(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !(name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_EXT)) {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target: "blob_store", file = %name, error = %e, "Failed to purge stale artifact")
                }
            }
        }
        Ok(purged)
    }
}

fn removal(artifact: &ArtifactRef, outcome: std::io::Result<()>) -> Result<bool> {
    match outcome {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(ChorusError::Cleanup(format!("{}: {}", artifact, e))),
    }
}

// Chorus Core Library
// Speech turn coordination for a pool of connected avatars

pub mod blob;
pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod selector;
pub mod synthesis;

// Export core types
pub use blob::{ArtifactRef, BlobStore};
pub use cleanup::{CleanupHandle, CleanupJob, CleanupWorker};
pub use config::ChorusConfig;
pub use dispatcher::{DispatchState, DispatcherStatus, SpeechDispatcher, SpeechQueueItem};
pub use protocol::{ClientMessage, Signal, UpdateKind};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use selector::{AvatarSelector, RecencyWindow};
pub use synthesis::{
    HttpSynthesizer, SpeechSynthesizer, StaticVoiceCatalog, SynthesisError, SynthesisGateway,
    VoiceCatalog, VoiceSelection,
};

use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum ChorusError {
    #[error("No avatars connected")]
    NoAvatarsConnected,

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Delivery failed: no live connection for avatar {avatar_id}")]
    Delivery { avatar_id: String },

    #[error("Cleanup error: {0}")]
    Cleanup(String),

    #[error("Speech request carries no text")]
    EmptyText,

    #[error("Invalid artifact reference: {0}")]
    InvalidArtifact(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, ChorusError>;

/// Core runtime: blob store, cleanup worker, registry and dispatcher wired together
pub struct Chorus {
    pub config: ChorusConfig,
    pub blob_store: Arc<BlobStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<SpeechDispatcher>,
    cleanup: CleanupHandle,
    cleanup_task: Option<(tokio::sync::oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Chorus {
    pub async fn new(
        config: ChorusConfig,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        catalog: Arc<dyn VoiceCatalog>,
    ) -> Result<Self> {
        tracing::info!("Starting Chorus...");

        let blob_store = Arc::new(BlobStore::open(&config.blob_dir).await?);
        let purged = blob_store.purge_stale().await?;
        if purged > 0 {
            tracing::info!(purged, "Removed artifacts left over from a previous run");
        }

        let (cleanup, shutdown_tx, join) = CleanupWorker::spawn(
            Arc::clone(&blob_store),
            config.cleanup_queue_capacity,
            config.cleanup_interval,
        );

        let registry = Arc::new(ConnectionRegistry::new());
        let gateway = SynthesisGateway::new(
            synthesizer,
            Arc::clone(&blob_store),
            cleanup.clone(),
            config.artifact_ttl,
        );
        let dispatcher = Arc::new(
            SpeechDispatcher::new(
                Arc::clone(&registry),
                gateway,
                catalog,
                cleanup.clone(),
                AvatarSelector::new(config.recency_window),
            )
            .with_stall_timeout(config.stall_timeout),
        );

        tracing::info!(blob_dir = %config.blob_dir.display(), "Chorus started successfully");
        Ok(Self {
            config,
            blob_store,
            registry,
            dispatcher,
            cleanup,
            cleanup_task: Some((shutdown_tx, join)),
        })
    }

    /// Handle used to file cleanup jobs from outside the dispatcher
    pub fn cleanup(&self) -> &CleanupHandle {
        &self.cleanup
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down Chorus...");

        let dropped = self.dispatcher.clear().await;
        if dropped > 0 {
            tracing::info!(dropped, "Dropped queued speech on shutdown");
        }

        if let Some((shutdown_tx, join)) = self.cleanup_task.take() {
            let _ = shutdown_tx.send(());
            join.await
                .map_err(|e| ChorusError::Cleanup(format!("cleanup worker panicked: {}", e)))?;
        }

        tracing::info!("Chorus shut down successfully");
        Ok(())
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use chorus_core::blob::ARTIFACT_ROUTE;
use chorus_core::{Chorus, ChorusError, ConnectionRegistry, SpeechDispatcher};

pub mod api;
pub mod event_stream;
pub mod socket;

pub use event_stream::{UpdateBroadcaster, UpdateEvent};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] ChorusError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Clone)]
pub struct BridgeState {
    pub dispatcher: Arc<SpeechDispatcher>,
    pub registry: Arc<ConnectionRegistry>,
    pub updates: UpdateBroadcaster,
    // served under /tts-blob
    pub blob_dir: PathBuf,
    pub connection_buffer: usize,
}

impl BridgeState {
    pub fn new(chorus: &Chorus) -> Self {
        Self {
            dispatcher: Arc::clone(&chorus.dispatcher),
            registry: Arc::clone(&chorus.registry),
            updates: UpdateBroadcaster::default(),
            blob_dir: chorus.blob_store.dir().to_path_buf(),
            connection_buffer: chorus.config.connection_buffer.max(1),
        }
    }
}

/// Every route the bridge serves
pub fn router(state: BridgeState) -> Router {
    let artifacts = ServeDir::new(&state.blob_dir).append_index_html_on_directories(false);

    Router::new()
        .route("/ws/tts", get(socket::ws_handler))
        .route("/update", post(api::update_handler))
        .route("/sse", get(api::sse_handler))
        .route("/api/avatars/active", get(api::active_avatars_handler))
        .route("/api/speech/status", get(api::speech_status_handler))
        .nest_service(ARTIFACT_ROUTE, artifacts)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve on an already-bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: BridgeState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn start_server<F>(addr: &str, state: BridgeState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| BridgeError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(target: "bridge", %addr, "Starting Chorus bridge server");
    serve(listener, state, shutdown).await
}

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use chorus_bridge::{start_server, BridgeState};
use chorus_core::{Chorus, ChorusConfig, HttpSynthesizer, StaticVoiceCatalog};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chorus_core=info,chorus_bridge=info"));
    fmt().compact().with_env_filter(filter).init();

    let config = ChorusConfig::load();
    let addr = config.server.addr();

    let synthesizer = Arc::new(HttpSynthesizer::new(
        config.tts.endpoint.clone(),
        Duration::from_millis(config.tts.timeout_ms),
    )?);
    if config.default_voices.is_empty() && config.voices.is_empty() {
        tracing::warn!("No TTS voices configured; every speech request will be dropped");
    }
    let catalog = Arc::new(StaticVoiceCatalog::from_config(&config));
    tracing::info!(tts = %synthesizer.endpoint(), "Using TTS service");

    let mut chorus = Chorus::new(config, synthesizer, catalog).await?;
    let state = BridgeState::new(&chorus);

    let server_result = start_server(&addr, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    })
    .await;

    chorus.shutdown().await?;
    server_result.map_err(|e| e.into())
}

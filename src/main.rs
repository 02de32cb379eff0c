//! streamwatch - Live Stream Object Detection
//!
//! Main entry point: wires the store, inference engine, notifier and
//! liveness checker into the orchestrator and runs until Ctrl-C.

use std::sync::Arc;
use streamwatch::{
    collaborators::{
        FfprobeLivenessChecker, LivenessChecker, LogNotifier, MemoryStore, Notifier,
        WebhookNotifier,
    },
    config::AppConfig,
    frame_source::FfmpegDecoder,
    inference::HttpInferenceEngine,
    orchestrator::{Orchestrator, OrchestratorDeps},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streamwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting streamwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    config.validate()?;
    tracing::info!(
        store_path = %config.store_path.display(),
        inference_url = %config.inference_url,
        webhook = config.notify_webhook_url.is_some(),
        poll_interval_sec = config.poll_interval_sec,
        "Configuration loaded"
    );

    let store = Arc::new(MemoryStore::load(&config.store_path).await?);

    let decoder = FfmpegDecoder::new(config.ffmpeg_path.clone());
    match decoder.check_available().await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::warn!(error = %e, "ffmpeg check failed, capture will fail until fixed"),
    }

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL not set, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    let liveness: Arc<dyn LivenessChecker> = Arc::new(FfprobeLivenessChecker::new(
        config.ffprobe_path.clone(),
        config.liveness_timeout(),
    ));

    let deps = OrchestratorDeps {
        channels: store.clone(),
        configs: store.clone(),
        liveness: Some(liveness),
        notifier,
        engine: Arc::new(HttpInferenceEngine::new(config.inference_url.clone())?),
        decoder: Arc::new(decoder),
    };
    let orchestrator = Orchestrator::new(deps, config.orchestrator_settings());

    orchestrator.start().await?;
    let restored = orchestrator.restore_enabled().await?;
    tracing::info!(channels = restored, "streamwatch running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    orchestrator.shutdown().await;
    Ok(())
}

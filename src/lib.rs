pub mod classify;
pub mod config;
pub mod db;
pub mod events;
pub mod inference;
pub mod metrics;
pub mod models;
pub mod persist;
pub mod pipeline;
pub mod sensing;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use classify::LocalClassifier;
use config::PipelineConfig;
use db::Database;
use events::EventBus;
use inference::{HttpPredictService, InferenceClient};
use metrics::PipelineMetrics;
use persist::{Backpressure, PersistSettings, RestStore, ResultPersister};
use pipeline::{PipelineComponents, PipelineScheduler, SchedulerSettings};
use sensing::{AnalogProbeSource, CommandCamera, FrameArchive};

/// Binary entry point. `edgesense readback` prints the stored sensor rows for
/// this device and exits; with no argument the pipeline runs until Ctrl+C or
/// SIGTERM.
pub fn run() -> Result<()> {
    utils::logging::init_logger();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let config = PipelineConfig::load()?;
    info!("EdgeSense starting up as {}", config.device_id);

    match std::env::args().nth(1).as_deref() {
        Some("readback") => runtime.block_on(readback(&config)),
        Some(other) => anyhow::bail!("unknown command: {other}"),
        None => runtime.block_on(run_pipeline(config)),
    }
}

async fn readback(config: &PipelineConfig) -> Result<()> {
    let store = RestStore::new(&config.store)?;
    let rows = store
        .readback(&config.device_id)
        .await
        .context("readback failed")?;
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn run_pipeline(config: PipelineConfig) -> Result<()> {
    let state_db = config.persist.state_db.clone();
    if let Some(parent) = state_db.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let database = Database::open(state_db)?;

    // A missing model file is bootstrapped; an unreadable one is fatal.
    let classifier = LocalClassifier::load_or_bootstrap(config.sensor.model_file.clone())
        .context("failed to load classification model")?;

    let predictor = HttpPredictService::new(
        &config.inference.predictor_url,
        Duration::from_secs(config.inference.timeout_secs),
    )?;
    let inference = InferenceClient::new(Arc::new(predictor), config.inference.model_version.clone());
    match inference.health().await {
        Ok(()) => info!("Predictor at {} is healthy", config.inference.predictor_url),
        Err(err) => warn!("Predictor health check failed: {err}"),
    }

    let events = EventBus::new();
    let metrics = PipelineMetrics::new();
    let store = RestStore::new(&config.store)?;
    let persister = ResultPersister::start(
        Arc::new(store),
        database,
        PersistSettings::from_config(&config.persist),
        Backpressure::new(config.persist.high_water_mark),
        metrics.clone(),
        events.clone(),
    )
    .await?;

    let components = PipelineComponents {
        sensor: Box::new(AnalogProbeSource::from_config(&config)),
        camera: Box::new(CommandCamera::from_config(&config)),
        classifier: Arc::new(classifier),
        inference,
        archive: FrameArchive::new(config.camera.image_dir.clone()),
        persister: Arc::new(persister),
        events,
        metrics,
    };
    let handle = PipelineScheduler::start(components, SchedulerSettings::from_config(&config));

    wait_for_shutdown_signal().await?;

    let report = handle.shutdown(config.shutdown_grace()).await;
    if report.undelivered > 0 {
        warn!(
            "{} record(s) undelivered at exit ({})",
            report.undelivered,
            if report.kept_on_disk {
                "kept in the on-disk retry queue"
            } else {
                "dead-lettered"
            }
        );
    }
    info!("EdgeSense stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
        _ = terminate.recv() => info!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")
}

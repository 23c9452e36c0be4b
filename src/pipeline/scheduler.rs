use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::classify::LocalClassifier;
use crate::config::PipelineConfig;
use crate::db::DeadLetter;
use crate::events::{EventBus, PipelineEvent};
use crate::inference::InferenceClient;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::persist::{BackoffPolicy, ResultPersister, ShutdownReport};
use crate::sensing::{FaultTracker, FrameArchive, ImageSource, SensorSource};

use super::context::BranchContext;
use super::image_branch::{ImageBranch, InferencePolicy};
use super::sensor_branch::SensorBranch;
use super::state::{Branch, BranchState, StateCell};

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Everything the two branches are built from.
pub struct PipelineComponents {
    pub sensor: Box<dyn SensorSource>,
    pub camera: Box<dyn ImageSource>,
    pub classifier: Arc<LocalClassifier>,
    pub inference: InferenceClient,
    pub archive: FrameArchive,
    pub persister: Arc<ResultPersister>,
    pub events: EventBus,
    pub metrics: PipelineMetrics,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sensor_interval: Duration,
    pub image_interval: Duration,
    pub inference: InferencePolicy,
    pub metrics_log_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            sensor_interval: config.sensor_interval(),
            image_interval: config.image_interval(),
            inference: InferencePolicy {
                timeout: Duration::from_secs(config.inference.timeout_secs),
                max_attempts: config.inference.max_attempts,
                backoff: BackoffPolicy::from_config(&config.persist),
            },
            metrics_log_interval: Duration::from_secs(config.metrics_log_interval_secs),
        }
    }
}

pub struct PipelineScheduler;

impl PipelineScheduler {
    /// Spawns both branches and the periodic metrics logger.
    pub fn start(components: PipelineComponents, settings: SchedulerSettings) -> PipelineHandle {
        let PipelineComponents {
            sensor,
            camera,
            classifier,
            inference,
            archive,
            persister,
            events,
            metrics,
        } = components;

        let cancel = CancellationToken::new();
        let mut states = HashMap::new();

        let mut context = |branch: Branch| {
            let (state, rx) = StateCell::new();
            states.insert(branch, rx);
            BranchContext {
                branch,
                persister: Arc::clone(&persister),
                metrics: metrics.clone(),
                events: events.clone(),
                state,
                cancel: cancel.clone(),
                health: FaultTracker::new(FaultTracker::DEFAULT_THRESHOLD),
            }
        };

        let sensor_branch = SensorBranch::new(
            sensor,
            Arc::clone(&classifier),
            settings.sensor_interval,
            context(Branch::Sensor),
        );
        let image_branch = ImageBranch::new(
            camera,
            archive,
            inference,
            settings.inference.clone(),
            settings.image_interval,
            context(Branch::Image),
        );

        let sensor_task = tokio::spawn(sensor_branch.run());
        let image_task = tokio::spawn(image_branch.run());
        let metrics_task = tokio::spawn(metrics_logger(
            metrics.clone(),
            Arc::clone(&persister),
            settings.metrics_log_interval,
            cancel.clone(),
        ));

        log_info!(
            "Pipeline started: sensor every {:?}, image every {:?}",
            settings.sensor_interval,
            settings.image_interval
        );

        PipelineHandle {
            cancel,
            branch_tasks: vec![(Branch::Sensor, sensor_task), (Branch::Image, image_task)],
            metrics_task,
            states,
            classifier,
            persister,
            events,
            metrics,
        }
    }
}

/// Control surface of a running pipeline.
pub struct PipelineHandle {
    cancel: CancellationToken,
    branch_tasks: Vec<(Branch, JoinHandle<()>)>,
    metrics_task: JoinHandle<()>,
    states: HashMap<Branch, watch::Receiver<BranchState>>,
    classifier: Arc<LocalClassifier>,
    persister: Arc<ResultPersister>,
    events: EventBus,
    metrics: PipelineMetrics,
}

impl PipelineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn branch_state(&self, branch: Branch) -> BranchState {
        self.states
            .get(&branch)
            .map(|rx| *rx.borrow())
            .unwrap_or(BranchState::Stopped)
    }

    pub fn watch_state(&self, branch: Branch) -> Option<watch::Receiver<BranchState>> {
        self.states.get(&branch).cloned()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.persister.queue_depth()).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.persister.dead_letters(limit).await
    }

    pub fn classifier(&self) -> &Arc<LocalClassifier> {
        &self.classifier
    }

    /// Stops new acquisitions, lets in-flight work finish and flushes the
    /// retry queue, all within `grace`. Branches still busy at the deadline
    /// are aborted.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        let deadline = Instant::now() + grace;
        log_info!("Shutting down pipeline, grace {grace:?}");
        self.cancel.cancel();

        for (branch, task) in self.branch_tasks.iter_mut() {
            match time::timeout_at(deadline, &mut *task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_error!("{branch} branch task failed: {err}"),
                Err(_) => {
                    log_warn!("{branch} branch still busy at the grace deadline, aborting");
                    task.abort();
                }
            }
        }

        if let Err(err) = (&mut self.metrics_task).await {
            log_error!("Metrics task failed: {err}");
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let report = self.persister.shutdown(remaining).await;

        let summary = self.metrics.snapshot(self.persister.queue_depth()).await;
        log_info!("Final metrics: {}", summary.summary());
        report
    }
}

async fn metrics_logger(
    metrics: PipelineMetrics,
    persister: Arc<ResultPersister>,
    every: Duration,
    cancel: CancellationToken,
) {
    if every.is_zero() {
        return;
    }

    let mut ticker = time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot(persister.queue_depth()).await;
                log_info!("Metrics: {}", snapshot.summary());
            }
            _ = cancel.cancelled() => break,
        }
    }
}

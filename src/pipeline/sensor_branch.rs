//! Sensor branch: poll the probes, classify locally, persist.

use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};

use crate::classify::{ClassifyError, LocalClassifier};
use crate::events::PipelineEvent;
use crate::metrics::Counter;
use crate::models::Reading;
use crate::sensing::SensorSource;

use super::context::{lock_device, BranchContext};
use super::state::BranchState;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub(crate) struct SensorBranch {
    source: Arc<Mutex<Box<dyn SensorSource>>>,
    classifier: Arc<LocalClassifier>,
    interval: Duration,
    model_missing: bool,
    ctx: BranchContext,
}

impl SensorBranch {
    pub fn new(
        source: Box<dyn SensorSource>,
        classifier: Arc<LocalClassifier>,
        interval: Duration,
        ctx: BranchContext,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            classifier,
            interval,
            model_missing: false,
            ctx,
        }
    }

    pub async fn run(mut self) {
        log_info!("Sensor branch started, interval {:?}", self.interval);
        let mut next = Instant::now();

        while self.ctx.wait_for_tick(next).await {
            let started = Instant::now();
            self.tick().await;
            next = self.ctx.next_tick(started, self.interval);
        }

        self.ctx.set_state(BranchState::Stopped);
        log_info!("Sensor branch stopped");
    }

    pub async fn tick(&mut self) {
        self.ctx.set_state(BranchState::Acquiring);
        if let Some(reading) = self.acquire().await {
            self.ctx.set_state(BranchState::Processing);
            if let Some(classification) = self.classify(reading).await {
                self.ctx.set_state(BranchState::Persisting);
                match self.ctx.persister.persist(classification.into()).await {
                    Ok(ack) => log_debug!("Sensor record persisted: {ack:?}"),
                    Err(fault) => log_warn!("Sensor record not persisted: {fault}"),
                }
            }
        }
        self.ctx.set_state(BranchState::Idle);
    }

    async fn acquire(&mut self) -> Option<Reading> {
        let source = Arc::clone(&self.source);
        let polled = tokio::task::spawn_blocking(move || lock_device(&source).poll()).await;

        match polled {
            Ok(Ok(reading)) => {
                self.ctx.metrics.incr(Counter::ReadingsPolled);
                self.ctx.record_success();
                Some(reading)
            }
            Ok(Err(fault)) => {
                self.ctx.metrics.incr(Counter::SensorFaults);
                self.ctx.record_fault(&fault);
                None
            }
            Err(join_err) => {
                log_error!("Sensor poll worker failed: {join_err}");
                self.ctx.metrics.incr(Counter::SensorFaults);
                self.ctx.record_fault(&join_err);
                None
            }
        }
    }

    async fn classify(&mut self, reading: Reading) -> Option<crate::models::Classification> {
        if !self.classifier.is_loaded() {
            if let Err(reason) = self.reload_model().await {
                self.ctx.metrics.incr(Counter::ClassificationSkipped);
                if !std::mem::replace(&mut self.model_missing, true) {
                    self.ctx.events.emit(PipelineEvent::ModelUnavailable { reason });
                }
                return None;
            }
        }

        match self.classifier.classify(reading) {
            Ok(classification) => {
                if std::mem::replace(&mut self.model_missing, false) {
                    log_info!("Classification resumed");
                }
                self.ctx.metrics.incr(Counter::Classifications);
                Some(classification)
            }
            Err(ClassifyError::ModelUnavailable) => {
                self.ctx.metrics.incr(Counter::ClassificationSkipped);
                if !std::mem::replace(&mut self.model_missing, true) {
                    self.ctx.events.emit(PipelineEvent::ModelUnavailable {
                        reason: ClassifyError::ModelUnavailable.to_string(),
                    });
                }
                None
            }
            Err(err) => {
                self.ctx.metrics.incr(Counter::ClassificationSkipped);
                log_warn!("Reading not classified: {err}");
                None
            }
        }
    }

    /// Reads the model file off the runtime threads.
    async fn reload_model(&self) -> Result<(), String> {
        let classifier = Arc::clone(&self.classifier);
        match tokio::task::spawn_blocking(move || classifier.reload()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(join_err) => {
                log_error!("Model reload worker failed: {join_err}");
                Err(join_err.to_string())
            }
        }
    }
}

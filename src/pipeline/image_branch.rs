//! Image branch: capture a frame, archive it, classify it remotely, persist.

use std::sync::{Arc, Mutex};

use tokio::time::{self, Duration, Instant};

use crate::events::PipelineEvent;
use crate::inference::{InferenceClient, InferenceError};
use crate::metrics::Counter;
use crate::models::{Frame, Prediction};
use crate::persist::BackoffPolicy;
use crate::sensing::{FrameArchive, ImageSource};

use super::context::{lock_device, BranchContext};
use super::state::BranchState;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// How the branch talks to the predictor.
#[derive(Debug, Clone)]
pub struct InferencePolicy {
    pub timeout: Duration,
    /// Total attempts per frame, the first one included.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

pub(crate) struct ImageBranch {
    source: Arc<Mutex<Box<dyn ImageSource>>>,
    archive: FrameArchive,
    client: InferenceClient,
    policy: InferencePolicy,
    interval: Duration,
    ctx: BranchContext,
}

impl ImageBranch {
    pub fn new(
        source: Box<dyn ImageSource>,
        archive: FrameArchive,
        client: InferenceClient,
        policy: InferencePolicy,
        interval: Duration,
        ctx: BranchContext,
    ) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
            archive,
            client,
            policy,
            interval,
            ctx,
        }
    }

    pub async fn run(mut self) {
        log_info!("Image branch started, interval {:?}", self.interval);
        let mut next = Instant::now();

        while self.ctx.wait_for_tick(next).await {
            let started = Instant::now();
            self.tick().await;
            next = self.ctx.next_tick(started, self.interval);
        }

        self.ctx.set_state(BranchState::Stopped);
        log_info!("Image branch stopped");
    }

    pub async fn tick(&mut self) {
        self.ctx.set_state(BranchState::Acquiring);
        if let Some(frame) = self.acquire().await {
            self.ctx.set_state(BranchState::Processing);
            if let Some(prediction) = self.process(&frame).await {
                self.ctx.set_state(BranchState::Persisting);
                match self.ctx.persister.persist(prediction.into()).await {
                    Ok(ack) => log_debug!("Prediction persisted: {ack:?}"),
                    Err(fault) => log_warn!("Prediction not persisted: {fault}"),
                }
            }
        }
        self.ctx.set_state(BranchState::Idle);
    }

    async fn acquire(&mut self) -> Option<Frame> {
        let source = Arc::clone(&self.source);
        let captured = tokio::task::spawn_blocking(move || lock_device(&source).capture()).await;

        match captured {
            Ok(Ok(frame)) => {
                self.ctx.metrics.incr(Counter::FramesCaptured);
                self.ctx.record_success();
                Some(frame)
            }
            Ok(Err(fault)) => {
                self.ctx.metrics.incr(Counter::CaptureFaults);
                self.ctx.record_fault(&fault);
                None
            }
            Err(join_err) => {
                log_error!("Capture worker failed: {join_err}");
                self.ctx.metrics.incr(Counter::CaptureFaults);
                self.ctx.record_fault(&join_err);
                None
            }
        }
    }

    async fn process(&self, frame: &Frame) -> Option<Prediction> {
        let image_reference = match self.archive.store(frame).await {
            Ok(path) => path,
            Err(err) => {
                log_error!("Skipping frame from {}: {err:#}", frame.captured_at());
                return None;
            }
        };

        match self.infer_with_retry(frame, &image_reference).await {
            Ok(prediction) => {
                self.ctx.metrics.incr(Counter::Predictions);
                Some(prediction)
            }
            Err((attempts, err)) => {
                self.ctx.metrics.incr(Counter::InferenceAbandoned);
                self.ctx.events.emit(PipelineEvent::InferenceAbandoned {
                    device_id: frame.device_id().to_string(),
                    captured_at: frame.captured_at(),
                    attempts,
                    last_error: err.to_string(),
                });
                None
            }
        }
    }

    /// Attempts inference until it succeeds, attempts run out, or the
    /// pipeline is cancelled. An attempt already in flight is never cut
    /// short by cancellation, only by the timeout.
    async fn infer_with_retry(
        &self,
        frame: &Frame,
        image_reference: &str,
    ) -> Result<Prediction, (u32, InferenceError)> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match time::timeout(
                self.policy.timeout,
                self.client.infer(frame, image_reference),
            )
            .await
            {
                Ok(Ok(prediction)) => return Ok(prediction),
                Ok(Err(err)) => err,
                Err(_) => InferenceError::Timeout,
            };
            self.ctx.metrics.incr(Counter::InferenceFailures);

            if !err.is_retryable() || attempt >= max_attempts {
                return Err((attempt, err));
            }
            if self.ctx.cancel.is_cancelled() {
                log_info!("Not retrying inference after shutdown signal");
                return Err((attempt, err));
            }

            let delay = self.policy.backoff.delay(attempt);
            log_warn!("Inference attempt {attempt} failed ({err}), retrying in {delay:?}");
            tokio::select! {
                _ = time::sleep(delay) => {}
                _ = self.ctx.cancel.cancelled() => {
                    log_info!("Not retrying inference after shutdown signal");
                    return Err((attempt, err));
                }
            }
        }
    }
}

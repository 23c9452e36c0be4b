use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, PipelineEvent};
use crate::metrics::{Counter, PipelineMetrics};
use crate::persist::{Backpressure, ResultPersister};
use crate::sensing::{FaultTracker, HealthTransition};

use super::state::{Branch, BranchState, StateCell};

const ENABLE_LOGS: bool = true;

/// Longest a throttled branch waits between ticks.
const MAX_DEFERRAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

use crate::{log_info, log_warn};

/// Everything a branch shares with the rest of the pipeline.
pub(crate) struct BranchContext {
    pub branch: Branch,
    pub persister: Arc<ResultPersister>,
    pub metrics: PipelineMetrics,
    pub events: EventBus,
    pub state: StateCell,
    pub cancel: CancellationToken,
    pub health: FaultTracker,
}

impl BranchContext {
    pub fn set_state(&self, state: BranchState) {
        self.state.set(state);
    }

    pub fn record_fault(&mut self, fault: &dyn std::fmt::Display) {
        log_warn!("{} acquisition fault: {fault}", self.branch);
        if let HealthTransition::BecameUnhealthy { consecutive_faults } =
            self.health.record_fault()
        {
            self.events.emit(PipelineEvent::DeviceUnhealthy {
                branch: self.branch,
                consecutive_faults,
                last_fault: fault.to_string(),
            });
        }
    }

    pub fn record_success(&mut self) {
        if self.health.record_success() == HealthTransition::Recovered {
            self.events.emit(PipelineEvent::DeviceRecovered {
                branch: self.branch,
            });
        }
    }

    fn backpressure(&self) -> Backpressure {
        self.persister.backpressure()
    }

    /// When the tick after one that started at `started` is due.
    pub fn next_tick(&self, started: Instant, interval: Duration) -> Instant {
        let backpressure = self.backpressure();
        let multiplier = backpressure.multiplier();
        if multiplier > 1 {
            self.metrics.incr(Counter::ThrottledTicks);
            log_info!(
                "{} branch throttled x{multiplier}: retry queue at {} (high-water mark {})",
                self.branch,
                backpressure.depth(),
                backpressure.high_water_mark()
            );
        }
        let delay = interval.saturating_mul(multiplier).min(MAX_DEFERRAL);
        started + delay
    }

    /// Waits for `at` unless cancelled first. Returns false on cancellation.
    pub async fn wait_for_tick(&self, at: Instant) -> bool {
        tokio::select! {
            _ = time::sleep_until(at) => true,
            _ = self.cancel.cancelled() => false,
        }
    }
}

pub(crate) fn lock_device<T: ?Sized>(device: &Mutex<Box<T>>) -> MutexGuard<'_, Box<T>> {
    match device.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

//! The two acquisition branches and the scheduler that runs them.

mod context;
mod image_branch;
mod scheduler;
mod sensor_branch;
mod state;

pub use image_branch::InferencePolicy;
pub use scheduler::{PipelineComponents, PipelineHandle, PipelineScheduler, SchedulerSettings};
pub use state::{Branch, BranchState};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    use crate::db::Database;
    use crate::events::EventBus;
    use crate::metrics::PipelineMetrics;
    use crate::persist::testing::MemoryStore;
    use crate::persist::{BackoffPolicy, Backpressure, PersistSettings, ResultPersister};
    use crate::sensing::FaultTracker;

    use super::context::BranchContext;
    use super::state::{Branch, BranchState, StateCell};

    /// A persister over a healthy in-memory store and a scratch database.
    pub async fn temp_persister(
        high_water_mark: usize,
    ) -> (tempfile::TempDir, Arc<ResultPersister>, Arc<MemoryStore>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("state.db")).unwrap();
        let store = Arc::new(MemoryStore::new());
        let settings = PersistSettings {
            max_attempts: 5,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60), 0.0),
            spill_to_disk: false,
        };
        let persister = ResultPersister::start(
            store.clone(),
            db,
            settings,
            Backpressure::new(high_water_mark),
            PipelineMetrics::new(),
            EventBus::new(),
        )
        .await
        .unwrap();
        (dir, Arc::new(persister), store)
    }

    pub fn context(
        branch: Branch,
        persister: Arc<ResultPersister>,
    ) -> (BranchContext, watch::Receiver<BranchState>) {
        let (state, rx) = StateCell::new();
        let ctx = BranchContext {
            branch,
            persister,
            metrics: PipelineMetrics::new(),
            events: EventBus::new(),
            state,
            cancel: CancellationToken::new(),
            health: FaultTracker::new(FaultTracker::DEFAULT_THRESHOLD),
        };
        (ctx, rx)
    }
}

//! Operator-visible pipeline events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::RecordKind;
use crate::pipeline::Branch;

const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    DeviceUnhealthy {
        branch: Branch,
        consecutive_faults: u32,
        last_fault: String,
    },
    DeviceRecovered {
        branch: Branch,
    },
    InferenceAbandoned {
        device_id: String,
        captured_at: DateTime<Utc>,
        attempts: u32,
        last_error: String,
    },
    DeadLettered {
        kind: RecordKind,
        idempotency_key: Uuid,
        reason: String,
        attempts: u32,
    },
    ModelUnavailable {
        reason: String,
    },
}

/// Fan-out of `PipelineEvent`s. Every event is also logged, so nothing is
/// lost when no one subscribes.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: PipelineEvent) {
        match &event {
            PipelineEvent::DeviceRecovered { branch } => {
                log_info!("{branch} device recovered");
            }
            PipelineEvent::DeadLettered {
                kind,
                idempotency_key,
                reason,
                attempts,
            } => {
                log_error!(
                    "Dead-lettered {} record {idempotency_key} after {attempts} attempt(s): {reason}",
                    kind.as_str()
                );
            }
            other => {
                log_warn!("Pipeline event: {other:?}");
            }
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(PipelineEvent::DeviceRecovered {
            branch: Branch::Sensor,
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::DeviceRecovered {
                branch: Branch::Sensor
            }
        );
    }

    #[test]
    fn emitting_without_subscribers_does_not_fail() {
        EventBus::new().emit(PipelineEvent::ModelUnavailable {
            reason: "unloaded".into(),
        });
    }
}

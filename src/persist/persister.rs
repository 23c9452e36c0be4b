//! Reliable delivery of finished records to the store.
//!
//! A submission is written straight away. Only a retryable failure puts the
//! record on its kind's FIFO queue, where a single drain task retries the
//! head with backoff until it is acknowledged, rejected, or out of attempts.
//! A record stays at the head of its queue while its write is in flight, so
//! later records of the same kind always queue behind it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex, Notify},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::config::PersistConfig;
use crate::db::{Database, DeadLetter};
use crate::events::{EventBus, PipelineEvent};
use crate::metrics::{Counter, PipelineMetrics};
use crate::models::{Record, RecordKind};

use super::backoff::BackoffPolicy;
use super::backpressure::Backpressure;
use super::store::{StoreError, StoreWriter, WriteOutcome};

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

pub const RETRIES_EXHAUSTED: &str = "retries exhausted";
pub const UNDELIVERED_AT_SHUTDOWN: &str = "undelivered at shutdown";
pub const SUBMITTED_AFTER_SHUTDOWN: &str = "submitted after shutdown";

#[derive(Debug, Clone)]
pub struct PersistSettings {
    /// Total write attempts per record, the immediate one included.
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub spill_to_disk: bool,
}

impl PersistSettings {
    pub fn from_config(config: &PersistConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffPolicy::from_config(config),
            spill_to_disk: config.spill_to_disk,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The store created the row.
    Stored,
    /// The store already had a row with this idempotency key.
    Duplicate,
    /// Handed to the retry queue; the drain task owns it now.
    Queued,
}

#[derive(Debug, Error)]
pub enum PersistFault {
    #[error("store rejected the record, dead-lettered: {0}")]
    Rejected(StoreError),
    #[error("retries exhausted, dead-lettered: {0}")]
    Exhausted(StoreError),
    #[error("persister is shutting down, record dead-lettered")]
    Closed,
}

struct Pending {
    record: Record,
    attempts: u32,
    due: Instant,
}

#[derive(Default)]
struct Queues {
    by_kind: HashMap<RecordKind, VecDeque<Pending>>,
}

impl Queues {
    fn queue(&mut self, kind: RecordKind) -> &mut VecDeque<Pending> {
        self.by_kind.entry(kind).or_default()
    }

    fn is_empty(&self) -> bool {
        self.by_kind.values().all(VecDeque::is_empty)
    }

    fn earliest_due(&self) -> Option<Instant> {
        self.by_kind
            .values()
            .filter_map(|queue| queue.front().map(|p| p.due))
            .min()
    }
}

struct Inner {
    store: Arc<dyn StoreWriter>,
    db: Database,
    settings: PersistSettings,
    queues: Mutex<Queues>,
    notify: Notify,
    backpressure: Backpressure,
    metrics: PipelineMetrics,
    events: EventBus,
    closed: AtomicBool,
}

/// What `shutdown` left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Records still queued when the grace period ran out.
    pub undelivered: usize,
    /// Whether those records remain in the on-disk retry queue.
    pub kept_on_disk: bool,
}

pub struct ResultPersister {
    inner: Arc<Inner>,
    drain_handle: Mutex<Option<JoinHandle<()>>>,
    flush_tx: watch::Sender<Option<Instant>>,
}

impl ResultPersister {
    /// Restores any spilled queue and spawns the drain task.
    pub async fn start(
        store: Arc<dyn StoreWriter>,
        db: Database,
        settings: PersistSettings,
        backpressure: Backpressure,
        metrics: PipelineMetrics,
        events: EventBus,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            store,
            db,
            settings,
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            backpressure,
            metrics,
            events,
            closed: AtomicBool::new(false),
        });

        if inner.settings.spill_to_disk {
            inner.restore_spilled().await?;
        }

        // None = normal operation, Some(deadline) = flush until deadline then exit
        let (flush_tx, flush_rx) = watch::channel(None);
        let handle = tokio::spawn(drain_loop(Arc::clone(&inner), flush_rx));

        Ok(Self {
            inner,
            drain_handle: Mutex::new(Some(handle)),
            flush_tx,
        })
    }

    pub async fn persist(&self, record: Record) -> Result<Ack, PersistFault> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::Acquire) {
            inner.dead_letter(record, SUBMITTED_AFTER_SHUTDOWN.into(), 0).await;
            return Err(PersistFault::Closed);
        }

        let kind = record.kind();
        let behind_others = !inner.queues.lock().await.queue(kind).is_empty();
        if behind_others {
            inner.enqueue(record, 0, Instant::now()).await;
            return Ok(Ack::Queued);
        }

        match inner.store.write(&record).await {
            Ok(outcome) => {
                inner.record_ack(&record, outcome);
                Ok(match outcome {
                    WriteOutcome::Created => Ack::Stored,
                    WriteOutcome::Duplicate => Ack::Duplicate,
                })
            }
            Err(err) if err.is_retryable() => {
                if inner.settings.max_attempts <= 1 {
                    inner
                        .dead_letter(record, format!("{RETRIES_EXHAUSTED}: {err}"), 1)
                        .await;
                    return Err(PersistFault::Exhausted(err));
                }
                inner.metrics.incr(Counter::WriteRetries);
                let delay = inner.settings.backoff.delay(1);
                log_warn!(
                    "{} write for {} failed ({err}), retrying in {:?}",
                    kind.as_str(),
                    record.idempotency_key(),
                    delay
                );
                inner.enqueue(record, 1, Instant::now() + delay).await;
                Ok(Ack::Queued)
            }
            Err(err) => {
                inner.dead_letter(record, err.to_string(), 1).await;
                Err(PersistFault::Rejected(err))
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.backpressure.depth()
    }

    pub fn backpressure(&self) -> Backpressure {
        self.inner.backpressure.clone()
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.inner.db.list_dead_letters(limit).await
    }

    /// Stops accepting work and drains the queues until they are empty or
    /// `grace` has elapsed. Leftovers stay in the spill table when spilling
    /// is on and are dead-lettered otherwise.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        let _ = self.flush_tx.send(Some(Instant::now() + grace));

        if let Some(handle) = self.drain_handle.lock().await.take() {
            if let Err(err) = handle.await {
                log_error!("Persist drain task failed to join: {err}");
            }
        }

        let leftovers: Vec<Pending> = {
            let mut queues = inner.queues.lock().await;
            queues
                .by_kind
                .values_mut()
                .flat_map(|queue| queue.drain(..))
                .collect()
        };
        for _ in &leftovers {
            inner.backpressure.decrement();
        }

        let undelivered = leftovers.len();
        let kept_on_disk = inner.settings.spill_to_disk;
        if undelivered == 0 {
            log_info!("Persist queue drained before shutdown");
        } else if kept_on_disk {
            log_warn!("{undelivered} record(s) left in the on-disk retry queue for next start");
        } else {
            log_warn!("{undelivered} record(s) undelivered at shutdown, dead-lettering");
            for pending in leftovers {
                inner
                    .dead_letter(pending.record, UNDELIVERED_AT_SHUTDOWN.into(), pending.attempts)
                    .await;
            }
        }

        ShutdownReport {
            undelivered,
            kept_on_disk,
        }
    }
}

impl Inner {
    async fn restore_spilled(&self) -> Result<()> {
        let spilled = self.db.load_spilled().await?;
        if spilled.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        for entry in spilled {
            queues.queue(entry.record.kind()).push_back(Pending {
                record: entry.record,
                attempts: entry.attempts,
                due: now,
            });
            self.backpressure.increment();
        }
        log_info!(
            "Restored {} queued record(s) from {}",
            self.backpressure.depth(),
            self.db.path().display()
        );
        Ok(())
    }

    async fn enqueue(&self, record: Record, attempts: u32, due: Instant) {
        if self.settings.spill_to_disk {
            if let Err(err) = self.db.spill_record(&record, attempts).await {
                log_warn!("Failed to spill {} to disk: {err:#}", record.idempotency_key());
            }
        }

        self.queues.lock().await.queue(record.kind()).push_back(Pending {
            record,
            attempts,
            due,
        });
        self.backpressure.increment();
        self.notify.notify_one();
    }

    async fn pop_head(&self, kind: RecordKind) {
        if self.queues.lock().await.queue(kind).pop_front().is_some() {
            self.backpressure.decrement();
        }
    }

    fn record_ack(&self, record: &Record, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Created => {
                self.metrics.incr(Counter::RecordsStored);
                log_debug!("Stored {} {}", record.kind().as_str(), record.idempotency_key());
            }
            WriteOutcome::Duplicate => {
                self.metrics.incr(Counter::RecordsDuplicate);
                log_debug!(
                    "Store already had {} {}",
                    record.kind().as_str(),
                    record.idempotency_key()
                );
            }
        }
    }

    async fn dead_letter(&self, record: Record, reason: String, attempts: u32) {
        let letter = DeadLetter::new(record, reason, attempts);
        let result = if self.settings.spill_to_disk {
            self.db.dead_letter_spilled(&letter).await
        } else {
            self.db.insert_dead_letter(&letter).await
        };

        if let Err(err) = result {
            // Last resort: the payload goes to the log.
            let payload = serde_json::to_string(&letter.record).unwrap_or_default();
            log_error!(
                "Failed to write dead letter {}: {err:#}; payload {payload}",
                letter.idempotency_key
            );
        }

        self.metrics.incr(Counter::DeadLettered);
        self.events.emit(PipelineEvent::DeadLettered {
            kind: letter.kind,
            idempotency_key: letter.idempotency_key,
            reason: letter.reason,
            attempts: letter.attempts,
        });
    }

    /// Tries every head that is due. Returns whether any write was made.
    async fn attempt_due(&self, deadline: Option<Instant>) -> bool {
        let mut progressed = false;
        for kind in RecordKind::ALL {
            progressed |= self.attempt_head(kind, deadline).await;
        }
        progressed
    }

    async fn attempt_head(&self, kind: RecordKind, deadline: Option<Instant>) -> bool {
        let (record, attempts) = {
            let mut queues = self.queues.lock().await;
            match queues.queue(kind).front() {
                Some(head) if head.due <= Instant::now() => (head.record.clone(), head.attempts),
                _ => return false,
            }
        };

        let result = match deadline {
            Some(deadline) => match time::timeout_at(deadline, self.store.write(&record)).await {
                Ok(result) => result,
                Err(_) => return false,
            },
            None => self.store.write(&record).await,
        };
        let attempts = attempts + 1;

        match result {
            Ok(outcome) => {
                self.record_ack(&record, outcome);
                if self.settings.spill_to_disk {
                    if let Err(err) = self.db.remove_spilled(record.idempotency_key()).await {
                        log_warn!("Failed to clear spilled {}: {err:#}", record.idempotency_key());
                    }
                }
                self.pop_head(kind).await;
            }
            Err(err) if err.is_retryable() && attempts < self.settings.max_attempts => {
                self.metrics.incr(Counter::WriteRetries);
                let delay = self.settings.backoff.delay(attempts);
                log_warn!(
                    "{} write for {} failed on attempt {attempts} ({err}), retrying in {:?}",
                    kind.as_str(),
                    record.idempotency_key(),
                    delay
                );
                if let Some(head) = self.queues.lock().await.queue(kind).front_mut() {
                    head.attempts = attempts;
                    head.due = Instant::now() + delay;
                }
                if self.settings.spill_to_disk {
                    if let Err(err) = self
                        .db
                        .update_spilled_attempts(record.idempotency_key(), attempts)
                        .await
                    {
                        log_warn!("Failed to update spilled attempts: {err:#}");
                    }
                }
            }
            Err(err) => {
                let reason = if err.is_retryable() {
                    format!("{RETRIES_EXHAUSTED}: {err}")
                } else {
                    err.to_string()
                };
                self.dead_letter(record, reason, attempts).await;
                self.pop_head(kind).await;
            }
        }
        true
    }
}

async fn drain_loop(inner: Arc<Inner>, mut flush_rx: watch::Receiver<Option<Instant>>) {
    loop {
        let deadline = *flush_rx.borrow_and_update();
        if let Some(deadline) = deadline {
            if inner.queues.lock().await.is_empty() || Instant::now() >= deadline {
                break;
            }
        }

        if inner.attempt_due(deadline).await {
            continue;
        }

        let next_due = inner.queues.lock().await.earliest_due();
        let wake_at = match (next_due, deadline) {
            (Some(due), Some(deadline)) => Some(due.min(deadline)),
            (due, None) => due,
            (None, deadline) => deadline,
        };

        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = sleep_until(wake_at) => {}
            changed = flush_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    log_debug!("Persist drain task exiting");
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

mod types;

pub use types::{CounterSnapshot, MetricsSnapshot, SystemMetrics};

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    ReadingsPolled,
    SensorFaults,
    Classifications,
    ClassificationSkipped,
    FramesCaptured,
    CaptureFaults,
    Predictions,
    InferenceFailures,
    InferenceAbandoned,
    RecordsStored,
    RecordsDuplicate,
    WriteRetries,
    DeadLettered,
    ThrottledTicks,
}

#[derive(Default)]
struct Counters {
    readings_polled: AtomicU64,
    sensor_faults: AtomicU64,
    classifications: AtomicU64,
    classification_skipped: AtomicU64,
    frames_captured: AtomicU64,
    capture_faults: AtomicU64,
    predictions: AtomicU64,
    inference_failures: AtomicU64,
    inference_abandoned: AtomicU64,
    records_stored: AtomicU64,
    records_duplicate: AtomicU64,
    write_retries: AtomicU64,
    dead_lettered: AtomicU64,
    throttled_ticks: AtomicU64,
}

impl Counters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::ReadingsPolled => &self.readings_polled,
            Counter::SensorFaults => &self.sensor_faults,
            Counter::Classifications => &self.classifications,
            Counter::ClassificationSkipped => &self.classification_skipped,
            Counter::FramesCaptured => &self.frames_captured,
            Counter::CaptureFaults => &self.capture_faults,
            Counter::Predictions => &self.predictions,
            Counter::InferenceFailures => &self.inference_failures,
            Counter::InferenceAbandoned => &self.inference_abandoned,
            Counter::RecordsStored => &self.records_stored,
            Counter::RecordsDuplicate => &self.records_duplicate,
            Counter::WriteRetries => &self.write_retries,
            Counter::DeadLettered => &self.dead_lettered,
            Counter::ThrottledTicks => &self.throttled_ticks,
        }
    }

    fn snapshot(&self) -> CounterSnapshot {
        let get = |slot: &AtomicU64| slot.load(Ordering::Relaxed);
        CounterSnapshot {
            readings_polled: get(&self.readings_polled),
            sensor_faults: get(&self.sensor_faults),
            classifications: get(&self.classifications),
            classification_skipped: get(&self.classification_skipped),
            frames_captured: get(&self.frames_captured),
            capture_faults: get(&self.capture_faults),
            predictions: get(&self.predictions),
            inference_failures: get(&self.inference_failures),
            inference_abandoned: get(&self.inference_abandoned),
            records_stored: get(&self.records_stored),
            records_duplicate: get(&self.records_duplicate),
            write_retries: get(&self.write_retries),
            dead_lettered: get(&self.dead_lettered),
            throttled_ticks: get(&self.throttled_ticks),
        }
    }
}

struct SystemSampler {
    system: System,
    pid: Pid,
}

/// Pipeline counters plus CPU and memory of this process.
#[derive(Clone)]
pub struct PipelineMetrics {
    counters: Arc<Counters>,
    sampler: Arc<Mutex<SystemSampler>>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            counters: Arc::new(Counters::default()),
            sampler: Arc::new(Mutex::new(SystemSampler { system, pid })),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.counters.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters.slot(counter).load(Ordering::Relaxed)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub async fn sample_system(&self) -> SystemMetrics {
        let mut sampler = self.sampler.lock().await;
        let pid = sampler.pid;
        sampler
            .system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]));

        match sampler.system.process(pid) {
            Some(process) => SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            },
            None => SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
        }
    }

    pub async fn snapshot(&self, queue_depth: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            taken_at: Utc::now(),
            system: self.sample_system().await,
            counters: self.counters(),
            queue_depth,
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub readings_polled: u64,
    pub sensor_faults: u64,
    pub classifications: u64,
    pub classification_skipped: u64,
    pub frames_captured: u64,
    pub capture_faults: u64,
    pub predictions: u64,
    pub inference_failures: u64,
    pub inference_abandoned: u64,
    pub records_stored: u64,
    pub records_duplicate: u64,
    pub write_retries: u64,
    pub dead_lettered: u64,
    pub throttled_ticks: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub system: SystemMetrics,
    pub counters: CounterSnapshot,
    pub queue_depth: usize,
}

impl MetricsSnapshot {
    /// One-line form for the periodic log summary.
    pub fn summary(&self) -> String {
        let c = &self.counters;
        format!(
            "readings={} faults={} classified={} skipped={} | frames={} capture_faults={} predictions={} inference_failures={} abandoned={} | stored={} duplicate={} retries={} dead_lettered={} queue={} throttled={} | cpu={:.1}% mem={:.1}MB",
            c.readings_polled,
            c.sensor_faults,
            c.classifications,
            c.classification_skipped,
            c.frames_captured,
            c.capture_faults,
            c.predictions,
            c.inference_failures,
            c.inference_abandoned,
            c.records_stored,
            c.records_duplicate,
            c.write_retries,
            c.dead_lettered,
            self.queue_depth,
            c.throttled_ticks,
            self.system.cpu_percent,
            self.system.memory_mb,
        )
    }
}

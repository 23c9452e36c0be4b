//! Rows of the local state database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Record, RecordKind};

/// A record that will not reach the store without operator attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Option<i64>,
    pub idempotency_key: Uuid,
    pub kind: RecordKind,
    pub device_id: String,
    pub captured_at: DateTime<Utc>,
    pub record: Record,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(record: Record, reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            id: None,
            idempotency_key: record.idempotency_key(),
            kind: record.kind(),
            device_id: record.device_id().to_string(),
            captured_at: record.captured_at(),
            record,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}

/// A queued record restored from the spill table.
#[derive(Debug, Clone)]
pub struct SpilledRecord {
    pub record: Record,
    pub attempts: u32,
}

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Classification, Prediction};

/// Namespace for record idempotency keys. Changing it re-keys every record.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x5d1c_9a0e_7f43_4b8e_a2c6_31e0_d94b_7c15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SensorReading,
    ImagePrediction,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::SensorReading, RecordKind::ImagePrediction];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::SensorReading => "sensor_reading",
            RecordKind::ImagePrediction => "image_prediction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sensor_reading" => Some(RecordKind::SensorReading),
            "image_prediction" => Some(RecordKind::ImagePrediction),
            _ => None,
        }
    }
}

/// A finished result on its way to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Record {
    Classification(Classification),
    Prediction(Prediction),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Classification(_) => RecordKind::SensorReading,
            Record::Prediction(_) => RecordKind::ImagePrediction,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Record::Classification(c) => c.device_id(),
            Record::Prediction(p) => p.device_id(),
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        match self {
            Record::Classification(c) => c.captured_at(),
            Record::Prediction(p) => p.captured_at(),
        }
    }

    pub fn idempotency_key(&self) -> Uuid {
        idempotency_key(self.kind(), self.device_id(), self.captured_at())
    }
}

impl From<Classification> for Record {
    fn from(value: Classification) -> Self {
        Record::Classification(value)
    }
}

impl From<Prediction> for Record {
    fn from(value: Prediction) -> Self {
        Record::Prediction(value)
    }
}

/// Deterministic key over (kind, device, capture instant).
pub fn idempotency_key(kind: RecordKind, device_id: &str, captured_at: DateTime<Utc>) -> Uuid {
    let name = format!(
        "{}|{}|{}",
        kind.as_str(),
        device_id,
        captured_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    );
    Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn key_is_stable_for_same_inputs() {
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let a = idempotency_key(RecordKind::SensorReading, "raspi-01", at);
        let b = idempotency_key(RecordKind::SensorReading, "raspi-01", at);
        assert_eq!(a, b);
    }

    #[test]
    fn key_separates_kind_device_and_instant() {
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let base = idempotency_key(RecordKind::SensorReading, "raspi-01", at);

        assert_ne!(base, idempotency_key(RecordKind::ImagePrediction, "raspi-01", at));
        assert_ne!(base, idempotency_key(RecordKind::SensorReading, "raspi-02", at));
        assert_ne!(
            base,
            idempotency_key(
                RecordKind::SensorReading,
                "raspi-01",
                at + Duration::nanoseconds(1)
            )
        );
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RecordKind::parse("unknown"), None);
    }
}

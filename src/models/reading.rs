use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ModelError;

/// One analog sample of the water probe set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ReadingFields")]
pub struct Reading {
    device_id: String,
    captured_at: DateTime<Utc>,
    temperature: f64,
    ph: f64,
    tds: f64,
}

#[derive(Deserialize)]
struct ReadingFields {
    device_id: String,
    captured_at: DateTime<Utc>,
    temperature: f64,
    ph: f64,
    tds: f64,
}

impl TryFrom<ReadingFields> for Reading {
    type Error = ModelError;

    fn try_from(f: ReadingFields) -> Result<Self, Self::Error> {
        Reading::new(f.device_id, f.captured_at, f.temperature, f.ph, f.tds)
    }
}

impl Reading {
    pub fn new(
        device_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        temperature: f64,
        ph: f64,
        tds: f64,
    ) -> Result<Self, ModelError> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(ModelError::EmptyDeviceId);
        }
        for (field, value) in [("temperature", temperature), ("ph", ph), ("tds", tds)] {
            if !value.is_finite() {
                return Err(ModelError::NonFiniteMeasurement { field, value });
            }
        }

        Ok(Self {
            device_id,
            captured_at,
            temperature,
            ph,
            tds,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn ph(&self) -> f64 {
        self.ph
    }

    pub fn tds(&self) -> f64 {
        self.tds
    }

    /// Feature vector in the fixed (temperature, ph, tds) order.
    pub fn features(&self) -> [f64; 3] {
        [self.temperature, self.ph, self.tds]
    }
}

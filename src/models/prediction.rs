use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{validate_confidence, validate_label, validate_model_version, ModelError};

/// Remote model verdict for exactly one `Frame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PredictionFields")]
pub struct Prediction {
    device_id: String,
    captured_at: DateTime<Utc>,
    label: String,
    confidence: f64,
    model_version: String,
    raw_output: Value,
    analyzed_at: DateTime<Utc>,
    image_reference: String,
}

#[derive(Deserialize)]
struct PredictionFields {
    device_id: String,
    captured_at: DateTime<Utc>,
    label: String,
    confidence: f64,
    model_version: String,
    raw_output: Value,
    analyzed_at: DateTime<Utc>,
    image_reference: String,
}

impl TryFrom<PredictionFields> for Prediction {
    type Error = ModelError;

    fn try_from(f: PredictionFields) -> Result<Self, Self::Error> {
        let output = PredictionOutput {
            label: f.label,
            confidence: f.confidence,
            model_version: f.model_version,
            raw_output: f.raw_output,
        };
        Prediction::new(f.device_id, f.captured_at, output, f.analyzed_at, f.image_reference)
    }
}

/// Fields of a `Prediction` that come from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutput {
    pub label: String,
    pub confidence: f64,
    pub model_version: String,
    pub raw_output: Value,
}

impl Prediction {
    /// `analyzed_at` earlier than the capture instant is raised to it.
    pub fn new(
        device_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        output: PredictionOutput,
        analyzed_at: DateTime<Utc>,
        image_reference: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(ModelError::EmptyDeviceId);
        }
        validate_label(&output.label)?;
        validate_confidence(output.confidence)?;
        validate_model_version(&output.model_version)?;

        Ok(Self {
            device_id,
            captured_at,
            label: output.label,
            confidence: output.confidence,
            model_version: output.model_version,
            raw_output: output.raw_output,
            analyzed_at: analyzed_at.max(captured_at),
            image_reference: image_reference.into(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn raw_output(&self) -> &Value {
        &self.raw_output
    }

    pub fn analyzed_at(&self) -> DateTime<Utc> {
        self.analyzed_at
    }

    pub fn image_reference(&self) -> &str {
        &self.image_reference
    }
}

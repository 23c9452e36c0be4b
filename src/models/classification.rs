use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{validate_label, validate_confidence, validate_model_version, ModelError, Reading};

/// Local kNN verdict for exactly one `Reading`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ClassificationFields")]
pub struct Classification {
    reading: Reading,
    label: String,
    confidence: f64,
    model_version: String,
    analyzed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ClassificationFields {
    reading: Reading,
    label: String,
    confidence: f64,
    model_version: String,
    analyzed_at: DateTime<Utc>,
}

impl TryFrom<ClassificationFields> for Classification {
    type Error = ModelError;

    fn try_from(f: ClassificationFields) -> Result<Self, Self::Error> {
        Classification::new(f.reading, f.label, f.confidence, f.model_version, f.analyzed_at)
    }
}

impl Classification {
    /// `analyzed_at` earlier than the capture instant is raised to it.
    pub fn new(
        reading: Reading,
        label: impl Into<String>,
        confidence: f64,
        model_version: impl Into<String>,
        analyzed_at: DateTime<Utc>,
    ) -> Result<Self, ModelError> {
        let label = label.into();
        let model_version = model_version.into();
        validate_label(&label)?;
        validate_confidence(confidence)?;
        validate_model_version(&model_version)?;
        let analyzed_at = analyzed_at.max(reading.captured_at());

        Ok(Self {
            reading,
            label,
            confidence,
            model_version,
            analyzed_at,
        })
    }

    pub fn device_id(&self) -> &str {
        self.reading.device_id()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.reading.captured_at()
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
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

    pub fn analyzed_at(&self) -> DateTime<Utc> {
        self.analyzed_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn reading() -> Reading {
        Reading::new("raspi-01", Utc::now(), 25.8, 7.0, 410.0).unwrap()
    }

    #[test]
    fn confidence_outside_unit_interval_is_rejected() {
        for bad in [-0.01, 1.01, f64::NAN] {
            let err = Classification::new(reading(), "normal", bad, "knn-1", Utc::now()).unwrap_err();
            assert!(matches!(err, ModelError::ConfidenceOutOfRange(_)));
        }
    }

    #[test]
    fn analyzed_at_never_precedes_capture() {
        let reading = reading();
        let captured_at = reading.captured_at();
        let skewed = captured_at - Duration::seconds(3);

        let classification = Classification::new(reading, "normal", 1.0, "knn-1", skewed).unwrap();
        assert_eq!(classification.analyzed_at(), captured_at);
    }

    #[test]
    fn decoding_runs_the_same_checks() {
        let good = Classification::new(reading(), "normal", 0.5, "knn-1", Utc::now()).unwrap();
        let mut value = serde_json::to_value(&good).unwrap();
        let back: Classification = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(back, good);

        value["confidence"] = serde_json::json!(1.5);
        assert!(serde_json::from_value::<Classification>(value.clone()).is_err());

        value["confidence"] = serde_json::json!(0.5);
        value["reading"]["device_id"] = serde_json::json!("");
        assert!(serde_json::from_value::<Classification>(value).is_err());
    }

    #[test]
    fn empty_model_version_is_rejected() {
        let err = Classification::new(reading(), "normal", 0.5, "  ", Utc::now()).unwrap_err();
        assert!(matches!(err, ModelError::MissingModelVersion));
    }
}

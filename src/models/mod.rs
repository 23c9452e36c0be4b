//! Records that flow through the pipeline.
//!
//! Every type validates its invariants on construction and exposes read-only
//! accessors, so a value that exists is a value that may be persisted.

mod classification;
mod frame;
mod prediction;
mod reading;
mod record;

pub use classification::Classification;
pub use frame::Frame;
pub use prediction::{Prediction, PredictionOutput};
pub use reading::Reading;
pub use record::{idempotency_key, Record, RecordKind};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("device id must not be empty")]
    EmptyDeviceId,
    #[error("{field} must be finite, got {value}")]
    NonFiniteMeasurement { field: &'static str, value: f64 },
    #[error("frame contains no image bytes")]
    EmptyFrame,
    #[error("confidence {0} is outside [0, 1]")]
    ConfidenceOutOfRange(f64),
    #[error("label must not be empty")]
    EmptyLabel,
    #[error("model version must not be empty")]
    MissingModelVersion,
}

fn validate_confidence(confidence: f64) -> Result<(), ModelError> {
    if (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(ModelError::ConfidenceOutOfRange(confidence))
    }
}

fn validate_label(label: &str) -> Result<(), ModelError> {
    if label.trim().is_empty() {
        Err(ModelError::EmptyLabel)
    } else {
        Ok(())
    }
}

fn validate_model_version(version: &str) -> Result<(), ModelError> {
    if version.trim().is_empty() {
        Err(ModelError::MissingModelVersion)
    } else {
        Ok(())
    }
}

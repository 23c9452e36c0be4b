//! Predictor response bodies.
//!
//! Two shapes are accepted. The flat shape carries one verdict:
//!
//! ```json
//! {"label": "algae", "confidence": 0.91, "model_version": "resnet50-v3", "timestamp": "..."}
//! ```
//!
//! The list shape is what the bundled FastAPI predictor returns; the highest
//! confidence entry wins:
//!
//! ```json
//! {"filename": "x.jpg", "width": 640, "height": 480,
//!  "predictions": [{"label": "algae", "confidence": 0.91}]}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::models::PredictionOutput;

use super::InferenceError;

#[derive(Debug, Deserialize)]
struct FlatBody {
    label: String,
    confidence: f64,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListBody {
    predictions: Vec<Candidate>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    label: String,
    confidence: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub output: PredictionOutput,
    /// When the service says it ran the model, if it says.
    pub analyzed_at: Option<DateTime<Utc>>,
}

pub fn parse_response(
    body: Value,
    fallback_model_version: Option<&str>,
) -> Result<ParsedResponse, InferenceError> {
    let (label, confidence, model_version, analyzed_at) = if body.get("predictions").is_some() {
        let list: ListBody = serde_json::from_value(body.clone())
            .map_err(|err| InferenceError::InvalidResponse(err.to_string()))?;
        let best = list
            .predictions
            .into_iter()
            .filter(|c| c.confidence.is_finite())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .ok_or_else(|| InferenceError::InvalidResponse("no predictions returned".into()))?;
        (best.label, best.confidence, list.model_version, None)
    } else {
        let flat: FlatBody = serde_json::from_value(body.clone())
            .map_err(|err| InferenceError::InvalidResponse(err.to_string()))?;
        let analyzed_at = flat.timestamp.as_deref().and_then(parse_timestamp);
        (flat.label, flat.confidence, flat.model_version, analyzed_at)
    };

    let model_version = model_version
        .filter(|v| !v.trim().is_empty())
        .or_else(|| fallback_model_version.map(str::to_string))
        .ok_or_else(|| {
            InferenceError::InvalidResponse("response has no model version".into())
        })?;

    Ok(ParsedResponse {
        output: PredictionOutput {
            label,
            confidence,
            model_version,
            raw_output: body,
        },
        analyzed_at,
    })
}

/// RFC 3339, or a naive ISO 8601 stamp read as UTC. Anything else is
/// ignored and the caller falls back to its own clock.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flat_shape_is_taken_as_is() {
        let body = json!({
            "label": "algae",
            "confidence": 0.91,
            "model_version": "resnet50-v3",
            "timestamp": "2025-03-26T18:45:02Z"
        });

        let parsed = parse_response(body.clone(), None).unwrap();
        assert_eq!(parsed.output.label, "algae");
        assert_eq!(parsed.output.confidence, 0.91);
        assert_eq!(parsed.output.model_version, "resnet50-v3");
        assert_eq!(parsed.output.raw_output, body);
        assert!(parsed.analyzed_at.is_some());
    }

    #[test]
    fn naive_timestamp_is_read_as_utc() {
        let body = json!({
            "label": "clear",
            "confidence": 0.8,
            "model_version": "v1",
            "timestamp": "2025-03-26T18:45:02.123456"
        });

        let parsed = parse_response(body, None).unwrap();
        let expected = DateTime::parse_from_rfc3339("2025-03-26T18:45:02.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parsed.analyzed_at, Some(expected));
    }

    #[test]
    fn unreadable_timestamp_is_ignored() {
        let body = json!({
            "label": "clear",
            "confidence": 0.8,
            "model_version": "v1",
            "timestamp": "yesterday"
        });

        let parsed = parse_response(body, None).unwrap();
        assert_eq!(parsed.output.label, "clear");
        assert!(parsed.analyzed_at.is_none());
    }

    #[test]
    fn list_shape_picks_highest_confidence() {
        let body = json!({
            "filename": "raspi-01.jpg",
            "width": 640,
            "height": 480,
            "predictions": [
                {"label": "clear", "confidence": 0.31},
                {"label": "turbid", "confidence": 0.58}
            ]
        });

        let parsed = parse_response(body, Some("resnet50-v3")).unwrap();
        assert_eq!(parsed.output.label, "turbid");
        assert_eq!(parsed.output.confidence, 0.58);
        assert_eq!(parsed.output.model_version, "resnet50-v3");
    }

    #[test]
    fn missing_model_version_without_fallback_is_invalid() {
        let body = json!({"label": "clear", "confidence": 0.5});
        assert!(matches!(
            parse_response(body, None),
            Err(InferenceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn empty_prediction_list_is_invalid() {
        let body = json!({"predictions": []});
        assert!(matches!(
            parse_response(body, Some("v1")),
            Err(InferenceError::InvalidResponse(_))
        ));
    }

    #[test]
    fn malformed_body_is_invalid() {
        assert!(matches!(
            parse_response(json!({"confidence": "high"}), Some("v1")),
            Err(InferenceError::InvalidResponse(_))
        ));
    }
}

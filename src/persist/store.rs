//! Write path to the central store's REST layer.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::{DuplicatePolicy, StoreConfig};
use crate::models::{Classification, Prediction, Record, RecordKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("network error: {0}")]
    Network(String),
    #[error("store request timed out")]
    Timeout,
    #[error("store unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },
    #[error("store rejected credentials ({status}): {message}")]
    Auth { status: u16, message: String },
    #[error("store rejected record ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("record encoding failed: {0}")]
    Encode(String),
}

impl StoreError {
    /// Network trouble, timeouts, 408, 429 and 5xx are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network(_) | StoreError::Timeout | StoreError::Unavailable { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The key was already stored; the row exists.
    Duplicate,
}

#[async_trait]
pub trait StoreWriter: Send + Sync {
    async fn write(&self, record: &Record) -> Result<WriteOutcome, StoreError>;
}

pub struct RestStore {
    client: Client,
    base_url: String,
    token: String,
    sensor_table: String,
    prediction_table: String,
    duplicate_policy: DuplicatePolicy,
}

impl RestStore {
    pub fn new(config: &StoreConfig) -> anyhow::Result<Self> {
        let token = config
            .token
            .clone()
            .context("store token is required")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build store HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token,
            sensor_table: config.sensor_table.clone(),
            prediction_table: config.prediction_table.clone(),
            duplicate_policy: config.duplicate_policy,
        })
    }

    fn table(&self, kind: RecordKind) -> &str {
        match kind {
            RecordKind::SensorReading => &self.sensor_table,
            RecordKind::ImagePrediction => &self.prediction_table,
        }
    }

    fn table_url(&self, kind: RecordKind) -> Result<Url, StoreError> {
        let raw = format!("{}/{}", self.base_url, self.table(kind));
        Url::parse(&raw).map_err(|err| StoreError::Encode(format!("{raw}: {err}")))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.token)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
    }

    /// Stored sensor rows for one device, oldest first.
    pub async fn readback(&self, device_id: &str) -> Result<Vec<Value>, StoreError> {
        let mut url = self.table_url(RecordKind::SensorReading)?;
        url.query_pairs_mut()
            .append_pair("raspi_id", &format!("eq.{device_id}"))
            .append_pair("order", "timestamp.asc");

        let response = self
            .authorized(self.client.get(url))
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(status_error(status, message));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| StoreError::Encode(format!("readback body: {err}")))
    }
}

#[async_trait]
impl StoreWriter for RestStore {
    async fn write(&self, record: &Record) -> Result<WriteOutcome, StoreError> {
        let mut url = self.table_url(record.kind())?;
        let prefer = match self.duplicate_policy {
            DuplicatePolicy::Ignore => {
                url.query_pairs_mut()
                    .append_pair("on_conflict", "idempotency_key");
                "return=minimal,resolution=ignore-duplicates"
            }
            DuplicatePolicy::Reject => "return=minimal",
        };

        let response = self
            .authorized(self.client.post(url))
            .header(header::CONTENT_TYPE, "application/json")
            .header("Idempotency-Key", record.idempotency_key().to_string())
            .header("Prefer", prefer)
            .json(&wire_body(record))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(WriteOutcome::Created);
        }
        if status == StatusCode::CONFLICT {
            return Ok(WriteOutcome::Duplicate);
        }
        let message = response.text().await.unwrap_or_default();
        Err(status_error(status, message))
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Network(err.to_string())
    }
}

pub(crate) fn status_error(status: StatusCode, message: String) -> StoreError {
    let code = status.as_u16();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StoreError::Unavailable {
            status: code,
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Auth {
            status: code,
            message,
        },
        s if s.is_server_error() => StoreError::Unavailable {
            status: code,
            message,
        },
        _ => StoreError::Rejected {
            status: code,
            message,
        },
    }
}

/// JSON row for the record's table.
pub fn wire_body(record: &Record) -> Value {
    match record {
        Record::Classification(c) => sensor_row(c, record),
        Record::Prediction(p) => prediction_row(p, record),
    }
}

fn sensor_row(classification: &Classification, record: &Record) -> Value {
    let reading = classification.reading();
    json!({
        "raspi_id": classification.device_id(),
        "timestamp": classification.captured_at(),
        "readings": {
            "temp": reading.temperature(),
            "ph": reading.ph(),
            "tds": reading.tds(),
        },
        "classification": classification.label(),
        "confidence": classification.confidence(),
        "model_version": classification.model_version(),
        "analyzed_at": classification.analyzed_at(),
        "idempotency_key": record.idempotency_key(),
    })
}

fn prediction_row(prediction: &Prediction, record: &Record) -> Value {
    json!({
        "raspi_id": prediction.device_id(),
        "timestamp": prediction.captured_at(),
        "image_path": prediction.image_reference(),
        "label": prediction.label(),
        "confidence": prediction.confidence(),
        "raw_output": prediction.raw_output(),
        "model_version": prediction.model_version(),
        "analyzed_at": prediction.analyzed_at(),
        "idempotency_key": record.idempotency_key(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PredictionOutput, Reading};
    use chrono::{TimeZone, Utc};

    fn classification() -> Record {
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let reading = Reading::new("raspi-01", at, 25.8, 7.0, 410.0).unwrap();
        Classification::new(reading, "normal", 1.0, "knn-reference-1", at)
            .unwrap()
            .into()
    }

    #[test]
    fn sensor_row_matches_table_columns() {
        let record = classification();
        let body = wire_body(&record);

        assert_eq!(body["raspi_id"], "raspi-01");
        assert_eq!(body["timestamp"], "2025-03-26T18:45:00Z");
        assert_eq!(body["readings"]["temp"], 25.8);
        assert_eq!(body["readings"]["ph"], 7.0);
        assert_eq!(body["readings"]["tds"], 410.0);
        assert_eq!(body["classification"], "normal");
        assert_eq!(body["confidence"], 1.0);
        assert_eq!(body["model_version"], "knn-reference-1");
        assert_eq!(
            body["idempotency_key"],
            record.idempotency_key().to_string()
        );
    }

    #[test]
    fn prediction_row_carries_image_path_and_raw_output() {
        let at = Utc.with_ymd_and_hms(2025, 3, 26, 18, 45, 0).unwrap();
        let raw = json!({"predictions": [{"label": "clear", "confidence": 0.9}]});
        let prediction = Prediction::new(
            "raspi-01",
            at,
            PredictionOutput {
                label: "clear".into(),
                confidence: 0.9,
                model_version: "resnet50-v3".into(),
                raw_output: raw.clone(),
            },
            at,
            "/captures/raspi-01/20250326T184500.000000Z.jpg",
        )
        .unwrap();
        let body = wire_body(&prediction.into());

        assert_eq!(
            body["image_path"],
            "/captures/raspi-01/20250326T184500.000000Z.jpg"
        );
        assert_eq!(body["label"], "clear");
        assert_eq!(body["raw_output"], raw);
    }

    #[test]
    fn status_codes_split_retryable_from_fatal() {
        let retryable = [500, 502, 503, 504, 408, 429];
        let fatal = [400, 401, 403, 404, 422];

        for code in retryable {
            let err = status_error(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(err.is_retryable(), "{code} should be retryable");
        }
        for code in fatal {
            let err = status_error(StatusCode::from_u16(code).unwrap(), String::new());
            assert!(!err.is_retryable(), "{code} should be fatal");
        }
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            StoreError::Auth { .. }
        ));
        assert!(StoreError::Timeout.is_retryable());
        assert!(StoreError::Network("refused".into()).is_retryable());
    }

    #[test]
    fn table_urls_keep_the_rest_prefix() {
        let store = RestStore::new(&StoreConfig {
            base_url: "http://localhost:8000/rest/v1/".into(),
            token: Some("secret".into()),
            ..StoreConfig::default()
        })
        .unwrap();

        assert_eq!(
            store.table_url(RecordKind::SensorReading).unwrap().as_str(),
            "http://localhost:8000/rest/v1/sensor_readings"
        );
        assert_eq!(
            store.table_url(RecordKind::ImagePrediction).unwrap().as_str(),
            "http://localhost:8000/rest/v1/image_predictions"
        );
    }
}

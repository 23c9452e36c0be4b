//! Remote image classification.

mod http;
mod response;

pub use http::HttpPredictService;
pub use response::{parse_response, ParsedResponse};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Frame, Prediction};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("inference timed out")]
    Timeout,
    #[error("inference service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("invalid inference response: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    /// Every failure mode is worth another attempt; the caller bounds how many.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InferenceError::Timeout
                | InferenceError::ServiceUnavailable(_)
                | InferenceError::InvalidResponse(_)
        )
    }
}

/// Transport to the predictor. Returns the raw JSON body of a successful call.
#[async_trait]
pub trait PredictService: Send + Sync {
    async fn predict(&self, frame: &Frame) -> Result<Value, InferenceError>;

    async fn health(&self) -> Result<(), InferenceError>;
}

#[derive(Clone)]
pub struct InferenceClient {
    service: Arc<dyn PredictService>,
    fallback_model_version: Option<String>,
}

impl InferenceClient {
    pub fn new(service: Arc<dyn PredictService>, fallback_model_version: Option<String>) -> Self {
        Self {
            service,
            fallback_model_version,
        }
    }

    /// One attempt. `image_reference` is where the frame was archived.
    pub async fn infer(
        &self,
        frame: &Frame,
        image_reference: &str,
    ) -> Result<Prediction, InferenceError> {
        let body = self.service.predict(frame).await?;
        let parsed = parse_response(body, self.fallback_model_version.as_deref())?;

        Prediction::new(
            frame.device_id(),
            frame.captured_at(),
            parsed.output,
            parsed.analyzed_at.unwrap_or_else(Utc::now),
            image_reference,
        )
        .map_err(|err| InferenceError::InvalidResponse(err.to_string()))
    }

    pub async fn health(&self) -> Result<(), InferenceError> {
        self.service.health().await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed script of predictor outcomes, one per call.
    pub struct ScriptedPredictService {
        script: Mutex<VecDeque<Result<Value, InferenceError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedPredictService {
        pub fn new(script: Vec<Result<Value, InferenceError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PredictService for ScriptedPredictService {
        async fn predict(&self, _frame: &Frame) -> Result<Value, InferenceError> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(InferenceError::ServiceUnavailable("script exhausted".into())))
        }

        async fn health(&self) -> Result<(), InferenceError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedPredictService;
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn frame() -> Frame {
        Frame::new("raspi-01", Utc::now(), vec![0xFF, 0xD8, 0xFF], "image/jpeg").unwrap()
    }

    #[tokio::test]
    async fn prediction_keeps_frame_identity_and_reference() {
        let service = Arc::new(ScriptedPredictService::new(vec![Ok(json!({
            "label": "clear",
            "confidence": 0.8,
            "model_version": "resnet50-v3"
        }))]));
        let client = InferenceClient::new(service, None);
        let frame = frame();

        let prediction = client.infer(&frame, "/captures/raspi-01/x.jpg").await.unwrap();

        assert_eq!(prediction.device_id(), "raspi-01");
        assert_eq!(prediction.captured_at(), frame.captured_at());
        assert_eq!(prediction.image_reference(), "/captures/raspi-01/x.jpg");
        assert!(prediction.analyzed_at() >= prediction.captured_at());
    }

    #[tokio::test]
    async fn stale_service_timestamp_is_clamped_to_capture() {
        let frame = frame();
        let stale = frame.captured_at() - Duration::minutes(5);
        let service = Arc::new(ScriptedPredictService::new(vec![Ok(json!({
            "label": "clear",
            "confidence": 0.8,
            "model_version": "resnet50-v3",
            "timestamp": stale.to_rfc3339()
        }))]));
        let client = InferenceClient::new(service, None);

        let prediction = client.infer(&frame, "ref").await.unwrap();
        assert_eq!(prediction.analyzed_at(), frame.captured_at());
    }

    #[tokio::test]
    async fn out_of_range_confidence_is_an_invalid_response() {
        let service = Arc::new(ScriptedPredictService::new(vec![Ok(json!({
            "label": "clear",
            "confidence": 1.7
        }))]));
        let client = InferenceClient::new(service, Some("resnet50-v3".into()));

        let err = client.infer(&frame(), "ref").await.unwrap_err();
        assert!(matches!(err, InferenceError::InvalidResponse(_)));
        assert!(err.is_retryable());
    }
}

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode, Url};
use serde_json::Value;

use crate::models::Frame;

use super::{InferenceError, PredictService};

/// Talks to the remote predictor over HTTP.
pub struct HttpPredictService {
    client: Client,
    predict_url: Url,
    health_url: Url,
    timeout: Duration,
}

impl HttpPredictService {
    pub fn new(predict_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let predict_url = Url::parse(predict_url)?;
        // `/predict` and `/health` are siblings.
        let health_url = predict_url.join("health")?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            predict_url,
            health_url,
            timeout,
        })
    }
}

#[async_trait]
impl PredictService for HttpPredictService {
    async fn predict(&self, frame: &Frame) -> Result<Value, InferenceError> {
        let file_name = format!(
            "{}-{}.{}",
            frame.device_id(),
            frame.captured_at().format("%Y%m%dT%H%M%S%.3fZ"),
            frame.extension()
        );
        let part = multipart::Part::bytes(frame.image_bytes().to_vec())
            .file_name(file_name)
            .mime_str(frame.content_type())
            .map_err(|err| InferenceError::InvalidResponse(format!("content type: {err}")))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.predict_url.clone())
            .timeout(self.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(transport_error)?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        response.json::<Value>().await.map_err(|err| {
            if err.is_timeout() {
                InferenceError::Timeout
            } else {
                InferenceError::InvalidResponse(err.to_string())
            }
        })
    }

    async fn health(&self) -> Result<(), InferenceError> {
        let response = self
            .client
            .get(self.health_url.clone())
            .send()
            .await
            .map_err(transport_error)?;

        match status_error(response.status()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn transport_error(err: reqwest::Error) -> InferenceError {
    if err.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::ServiceUnavailable(err.to_string())
    }
}

pub(crate) fn status_error(status: StatusCode) -> Option<InferenceError> {
    if status.is_success() {
        None
    } else if status == StatusCode::REQUEST_TIMEOUT {
        Some(InferenceError::Timeout)
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(InferenceError::ServiceUnavailable(format!("HTTP {status}")))
    } else {
        Some(InferenceError::InvalidResponse(format!("HTTP {status}")))
    }
}

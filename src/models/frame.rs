use std::fmt;

use chrono::{DateTime, Utc};

use super::ModelError;

/// Still image captured from the device camera.
#[derive(Clone)]
pub struct Frame {
    device_id: String,
    captured_at: DateTime<Utc>,
    image_bytes: Vec<u8>,
    content_type: String,
}

impl Frame {
    pub fn new(
        device_id: impl Into<String>,
        captured_at: DateTime<Utc>,
        image_bytes: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let device_id = device_id.into();
        if device_id.is_empty() {
            return Err(ModelError::EmptyDeviceId);
        }
        if image_bytes.is_empty() {
            return Err(ModelError::EmptyFrame);
        }

        Ok(Self {
            device_id,
            captured_at,
            image_bytes,
            content_type: content_type.into(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// File extension matching the content type, used for archive and upload names.
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_str() {
            "image/jpeg" => "jpg",
            "image/png" => "png",
            "image/bmp" => "bmp",
            "image/webp" => "webp",
            "image/tiff" => "tiff",
            _ => "bin",
        }
    }
}

// Image payloads are large; keep them out of log lines.
impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("device_id", &self.device_id)
            .field("captured_at", &self.captured_at)
            .field("bytes", &self.image_bytes.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::models::Frame;

/// Keeps every captured frame on local disk. The stored path becomes the
/// prediction's `image_reference`.
#[derive(Debug, Clone)]
pub struct FrameArchive {
    root: PathBuf,
}

impl FrameArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, frame: &Frame) -> PathBuf {
        let stamp = frame.captured_at().format("%Y%m%dT%H%M%S%.9fZ");
        self.root
            .join(frame.device_id())
            .join(format!("{stamp}.{}", frame.extension()))
    }

    pub async fn store(&self, frame: &Frame) -> Result<String> {
        let path = self.path_for(frame);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, frame.image_bytes())
            .await
            .with_context(|| format!("failed to archive frame to {}", path.display()))?;
        Ok(path.display().to_string())
    }
}

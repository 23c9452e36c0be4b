//! Single-still capture through an ffmpeg subprocess on a V4L2 device.

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use image::ImageFormat;
use thiserror::Error;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::{Frame, ModelError};
use crate::utils::MonotonicClock;

#[derive(Debug, Error)]
pub enum CaptureFault {
    #[error("camera device {0} not found")]
    DeviceNotFound(String),
    #[error("capture command failed: {0}")]
    Command(String),
    #[error("camera returned an empty frame")]
    EmptyFrame,
    #[error("captured bytes are not a recognised image: {0}")]
    UndecodableFrame(String),
    #[error(transparent)]
    Invalid(#[from] ModelError),
}

/// Blocking capture. Called from a blocking worker, never on the runtime.
pub trait ImageSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureFault>;
}

pub struct CommandCamera {
    device_id: String,
    device_path: PathBuf,
    ffmpeg_bin: String,
    scratch_dir: PathBuf,
    clock: MonotonicClock,
}

impl CommandCamera {
    pub fn new(
        device_id: impl Into<String>,
        device: &str,
        ffmpeg_bin: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_path: resolve_device(device),
            ffmpeg_bin: ffmpeg_bin.into(),
            scratch_dir: scratch_dir.into(),
            clock: MonotonicClock::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.device_id.clone(),
            &config.camera.device,
            config.camera.ffmpeg_bin.clone(),
            std::env::temp_dir(),
        )
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    fn grab(&self, output: &Path) -> Result<Vec<u8>, CaptureFault> {
        let result = Command::new(&self.ffmpeg_bin)
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("video4linux2")
            .arg("-i")
            .arg(&self.device_path)
            .arg("-frames:v")
            .arg("1")
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|err| CaptureFault::Command(format!("spawn {}: {err}", self.ffmpeg_bin)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(CaptureFault::Command(format!(
                "{} exited with {}: {}",
                self.ffmpeg_bin,
                result.status,
                stderr.trim()
            )));
        }

        match fs::read(output) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(CaptureFault::Command(format!(
                "read {}: {err}",
                output.display()
            ))),
        }
    }
}

impl ImageSource for CommandCamera {
    fn capture(&mut self) -> Result<Frame, CaptureFault> {
        if !self.device_path.exists() {
            return Err(CaptureFault::DeviceNotFound(
                self.device_path.display().to_string(),
            ));
        }

        let output = self
            .scratch_dir
            .join(format!("edgesense-capture-{}.jpg", Uuid::new_v4()));
        let grabbed = self.grab(&output);
        let _ = fs::remove_file(&output);

        let captured_at = self.clock.now();
        frame_from_bytes(&self.device_id, captured_at, grabbed?)
    }
}

/// Validates raw capture output and tags it with its detected content type.
pub fn frame_from_bytes(
    device_id: &str,
    captured_at: chrono::DateTime<chrono::Utc>,
    bytes: Vec<u8>,
) -> Result<Frame, CaptureFault> {
    if bytes.is_empty() {
        return Err(CaptureFault::EmptyFrame);
    }
    let format = image::guess_format(&bytes)
        .map_err(|err| CaptureFault::UndecodableFrame(err.to_string()))?;
    let content_type = content_type_for(format)
        .ok_or_else(|| CaptureFault::UndecodableFrame(format!("unsupported format {format:?}")))?;

    Ok(Frame::new(device_id, captured_at, bytes, content_type)?)
}

fn content_type_for(format: ImageFormat) -> Option<&'static str> {
    match format {
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Bmp => Some("image/bmp"),
        ImageFormat::WebP => Some("image/webp"),
        ImageFormat::Tiff => Some("image/tiff"),
        _ => None,
    }
}

/// `"0"` and `"/dev/video0"` both name the first V4L2 node.
pub(crate) fn parse_device_index(device: &str) -> Option<u32> {
    if let Ok(index) = device.trim().parse::<u32>() {
        return Some(index);
    }
    device
        .strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

fn resolve_device(device: &str) -> PathBuf {
    match parse_device_index(device) {
        Some(index) => PathBuf::from(format!("/dev/video{index}")),
        None => PathBuf::from(device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
    const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0, 16, b'J', b'F', b'I', b'F'];

    #[test]
    fn device_index_accepts_number_or_node() {
        assert_eq!(parse_device_index("0"), Some(0));
        assert_eq!(parse_device_index("/dev/video2"), Some(2));
        assert_eq!(parse_device_index("/dev/video"), None);
        assert_eq!(parse_device_index("rtsp://cam"), None);
        assert_eq!(resolve_device("1"), PathBuf::from("/dev/video1"));
    }

    #[test]
    fn missing_device_node_is_reported() {
        let mut camera = CommandCamera::new("raspi-01", "/dev/video-missing", "ffmpeg", "/tmp");
        assert!(matches!(
            camera.capture(),
            Err(CaptureFault::DeviceNotFound(_))
        ));
    }

    #[test]
    fn content_type_follows_detected_format() {
        let png = frame_from_bytes("raspi-01", Utc::now(), PNG_MAGIC.to_vec()).unwrap();
        assert_eq!(png.content_type(), "image/png");

        let jpeg = frame_from_bytes("raspi-01", Utc::now(), JPEG_MAGIC.to_vec()).unwrap();
        assert_eq!(jpeg.content_type(), "image/jpeg");
    }

    #[test]
    fn empty_and_garbage_bytes_are_faults() {
        assert!(matches!(
            frame_from_bytes("raspi-01", Utc::now(), Vec::new()),
            Err(CaptureFault::EmptyFrame)
        ));
        assert!(matches!(
            frame_from_bytes("raspi-01", Utc::now(), b"not an image".to_vec()),
            Err(CaptureFault::UndecodableFrame(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_a_command_fault() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("video0");
        fs::write(&node, b"").unwrap();

        let mut camera = CommandCamera::new(
            "raspi-01",
            node.to_str().unwrap(),
            "false",
            dir.path(),
        );
        assert!(matches!(camera.capture(), Err(CaptureFault::Command(_))));
    }
}

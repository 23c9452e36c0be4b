//! Pipeline configuration.
//!
//! Values come from built-in defaults, then an optional JSON file named by
//! `EDGESENSE_CONFIG`, then environment variables. The resulting
//! `PipelineConfig` is validated once and handed to each component by
//! reference; nothing reads the environment after startup.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_VAR: &str = "EDGESENSE_CONFIG";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// How the store treats a second insert with a known idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Ask the store to drop the duplicate silently (`resolution=ignore-duplicates`).
    Ignore,
    /// Let the store answer 409; the persister counts that as an ack.
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(DuplicatePolicy::Ignore),
            "reject" => Ok(DuplicatePolicy::Reject),
            other => Err(format!("expected `ignore` or `reject`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub sensor_table: String,
    pub prediction_table: String,
    pub duplicate_policy: DuplicatePolicy,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/rest/v1".into(),
            token: None,
            sensor_table: "sensor_readings".into(),
            prediction_table: "image_predictions".into(),
            duplicate_policy: DuplicatePolicy::Ignore,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    pub predictor_url: String,
    pub model_version: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            predictor_url: "http://localhost:8080/predict".into(),
            model_version: None,
            timeout_secs: 5,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SensorConfig {
    pub interval_secs: u64,
    pub iio_device_dir: PathBuf,
    pub ph_channel: u8,
    pub tds_channel: u8,
    pub adc_vref: f64,
    /// DS18B20 `w1_slave` file; a simulated probe is used when absent.
    pub w1_temp_path: Option<PathBuf>,
    pub model_file: PathBuf,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            iio_device_dir: PathBuf::from("/sys/bus/iio/devices/iio:device0"),
            ph_channel: 0,
            tds_channel: 1,
            adc_vref: 3.3,
            w1_temp_path: None,
            model_file: PathBuf::from("./knn_model.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    pub interval_secs: u64,
    pub device: String,
    pub ffmpeg_bin: String,
    pub image_dir: PathBuf,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            device: "0".into(),
            ffmpeg_bin: "ffmpeg".into(),
            image_dir: PathBuf::from("./captures"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistConfig {
    pub max_attempts: u32,
    pub high_water_mark: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Fractional jitter applied to every backoff delay (0.2 = ±20%).
    pub jitter: f64,
    pub state_db: PathBuf,
    pub spill_to_disk: bool,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            high_water_mark: 256,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter: 0.2,
            state_db: PathBuf::from("./edgesense.db"),
            spill_to_disk: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub device_id: String,
    pub store: StoreConfig,
    pub inference: InferenceConfig,
    pub sensor: SensorConfig,
    pub camera: CameraConfig,
    pub persist: PersistConfig,
    pub shutdown_grace_secs: u64,
    pub metrics_log_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            device_id: "raspi-01".into(),
            store: StoreConfig::default(),
            inference: InferenceConfig::default(),
            sensor: SensorConfig::default(),
            camera: CameraConfig::default(),
            persist: PersistConfig::default(),
            shutdown_grace_secs: 10,
            metrics_log_interval_secs: 300,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then the optional JSON file, then the process environment.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))
    }

    /// Overlay variables resolved through `lookup` (the process environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(v) = get("RASPI_ID") {
            self.device_id = v;
        }

        // Supabase-style names are accepted as fallbacks.
        if let Some(v) = get("STORE_URL") {
            self.store.base_url = v;
        } else if let Some(v) = get("SUPABASE_URL") {
            self.store.base_url = format!("{}/rest/v1", v.trim_end_matches('/'));
        }
        if let Some(v) = get("STORE_TOKEN").or_else(|| get("SUPABASE_KEY")) {
            self.store.token = Some(v);
        }
        if let Some(v) = get("SENSOR_TABLE") {
            self.store.sensor_table = v;
        }
        if let Some(v) = get("PREDICTION_TABLE") {
            self.store.prediction_table = v;
        }
        if let Some(v) = get("DUPLICATE_POLICY") {
            self.store.duplicate_policy = parse_var("DUPLICATE_POLICY", v)?;
        }
        if let Some(v) = get("STORE_TIMEOUT_SECS") {
            self.store.timeout_secs = parse_var("STORE_TIMEOUT_SECS", v)?;
        }

        if let Some(v) = get("PREDICTOR_URL") {
            self.inference.predictor_url = v;
        }
        if let Some(v) = get("INFERENCE_MODEL_VERSION") {
            self.inference.model_version = Some(v);
        }
        if let Some(v) = get("INFERENCE_TIMEOUT_SECS") {
            self.inference.timeout_secs = parse_var("INFERENCE_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = get("INFERENCE_MAX_ATTEMPTS") {
            self.inference.max_attempts = parse_var("INFERENCE_MAX_ATTEMPTS", v)?;
        }

        if let Some(v) = get("SENSOR_INTERVAL_SECS") {
            self.sensor.interval_secs = parse_var("SENSOR_INTERVAL_SECS", v)?;
        }
        if let Some(v) = get("IIO_DEVICE_DIR") {
            self.sensor.iio_device_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PH_CHANNEL") {
            self.sensor.ph_channel = parse_var("PH_CHANNEL", v)?;
        }
        if let Some(v) = get("TDS_CHANNEL") {
            self.sensor.tds_channel = parse_var("TDS_CHANNEL", v)?;
        }
        if let Some(v) = get("ADC_VREF") {
            self.sensor.adc_vref = parse_var("ADC_VREF", v)?;
        }
        if let Some(v) = get("W1_TEMP_PATH") {
            self.sensor.w1_temp_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("MODEL_FILE") {
            self.sensor.model_file = PathBuf::from(v);
        }

        if let Some(v) = get("IMAGE_INTERVAL_SECS") {
            self.camera.interval_secs = parse_var("IMAGE_INTERVAL_SECS", v)?;
        }
        if let Some(v) = get("CAMERA_DEVICE").or_else(|| get("CAMERA_INDEX")) {
            self.camera.device = v;
        }
        if let Some(v) = get("FFMPEG_BIN") {
            self.camera.ffmpeg_bin = v;
        }
        if let Some(v) = get("IMAGE_DIR") {
            self.camera.image_dir = PathBuf::from(v);
        }

        if let Some(v) = get("PERSIST_MAX_ATTEMPTS") {
            self.persist.max_attempts = parse_var("PERSIST_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = get("HIGH_WATER_MARK") {
            self.persist.high_water_mark = parse_var("HIGH_WATER_MARK", v)?;
        }
        if let Some(v) = get("STATE_DB") {
            self.persist.state_db = PathBuf::from(v);
        }
        if let Some(v) = get("SPILL_TO_DISK") {
            self.persist.spill_to_disk = parse_flag("SPILL_TO_DISK", &v)?;
        }

        if let Some(v) = get("SHUTDOWN_GRACE_SECS") {
            self.shutdown_grace_secs = parse_var("SHUTDOWN_GRACE_SECS", v)?;
        }
        if let Some(v) = get("METRICS_LOG_INTERVAL_SECS") {
            self.metrics_log_interval_secs = parse_var("METRICS_LOG_INTERVAL_SECS", v)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_id.trim().is_empty() {
            return Err(ConfigError::Missing("RASPI_ID"));
        }
        if self.store.token.as_deref().map_or(true, |t| t.trim().is_empty()) {
            return Err(ConfigError::Missing("STORE_TOKEN"));
        }
        check_url("STORE_URL", &self.store.base_url)?;
        check_url("PREDICTOR_URL", &self.inference.predictor_url)?;

        for (key, value) in [
            ("SENSOR_INTERVAL_SECS", self.sensor.interval_secs),
            ("IMAGE_INTERVAL_SECS", self.camera.interval_secs),
            ("INFERENCE_TIMEOUT_SECS", self.inference.timeout_secs),
            ("STORE_TIMEOUT_SECS", self.store.timeout_secs),
        ] {
            if value == 0 {
                return Err(invalid(key, value, "must be at least 1"));
            }
        }
        if self.inference.max_attempts == 0 {
            return Err(invalid("INFERENCE_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.persist.max_attempts == 0 {
            return Err(invalid("PERSIST_MAX_ATTEMPTS", 0, "must be at least 1"));
        }
        if self.persist.high_water_mark == 0 {
            return Err(invalid("HIGH_WATER_MARK", 0, "must be at least 1"));
        }
        for (key, channel) in [
            ("PH_CHANNEL", self.sensor.ph_channel),
            ("TDS_CHANNEL", self.sensor.tds_channel),
        ] {
            if channel > 7 {
                return Err(invalid(key, channel, "MCP3008 channel must be 0-7"));
            }
        }
        if self.sensor.ph_channel == self.sensor.tds_channel {
            return Err(invalid(
                "TDS_CHANNEL",
                self.sensor.tds_channel,
                "must differ from PH_CHANNEL",
            ));
        }
        if !(self.sensor.adc_vref.is_finite() && self.sensor.adc_vref > 0.0) {
            return Err(invalid("ADC_VREF", self.sensor.adc_vref, "must be positive"));
        }
        if !(0.0..1.0).contains(&self.persist.jitter) {
            return Err(invalid("jitter", self.persist.jitter, "must be in [0, 1)"));
        }
        if self.persist.base_backoff_ms == 0
            || self.persist.max_backoff_ms < self.persist.base_backoff_ms
        {
            return Err(invalid(
                "max_backoff_ms",
                self.persist.max_backoff_ms,
                "must be >= base_backoff_ms > 0",
            ));
        }
        Ok(())
    }

    pub fn sensor_interval(&self) -> Duration {
        Duration::from_secs(self.sensor.interval_secs)
    }

    pub fn image_interval(&self) -> Duration {
        Duration::from_secs(self.camera.interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn parse_var<T>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse::<T>().map_err(|err| ConfigError::Invalid {
        key,
        value: raw.clone(),
        reason: err.to_string(),
    })
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, raw, "expected a boolean")),
    }
}

fn check_url(key: &'static str, raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|err| invalid(key, raw, err))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(key, raw, format!("unsupported scheme `{other}`"))),
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_need_only_a_token() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::Missing("STORE_TOKEN")));

        config.apply_env(env(&[("STORE_TOKEN", "secret")])).unwrap();
        config.validate().unwrap();
        assert_eq!(config.inference.max_attempts, 5);
        assert_eq!(config.sensor_interval(), Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_every_cadence_and_ceiling() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                ("STORE_TOKEN", "secret"),
                ("RASPI_ID", "raspi-07"),
                ("SENSOR_INTERVAL_SECS", "2"),
                ("IMAGE_INTERVAL_SECS", "30"),
                ("INFERENCE_TIMEOUT_SECS", "3"),
                ("PERSIST_MAX_ATTEMPTS", "4"),
                ("HIGH_WATER_MARK", "16"),
                ("DUPLICATE_POLICY", "reject"),
                ("SPILL_TO_DISK", "true"),
            ]))
            .unwrap();
        config.validate().unwrap();

        assert_eq!(config.device_id, "raspi-07");
        assert_eq!(config.image_interval(), Duration::from_secs(30));
        assert_eq!(config.inference.timeout_secs, 3);
        assert_eq!(config.persist.max_attempts, 4);
        assert_eq!(config.persist.high_water_mark, 16);
        assert_eq!(config.store.duplicate_policy, DuplicatePolicy::Reject);
        assert!(config.persist.spill_to_disk);
    }

    #[test]
    fn supabase_names_are_accepted() {
        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[
                ("SUPABASE_URL", "https://abc.supabase.co/"),
                ("SUPABASE_KEY", "anon"),
            ]))
            .unwrap();
        assert_eq!(config.store.base_url, "https://abc.supabase.co/rest/v1");
        assert_eq!(config.store.token.as_deref(), Some("anon"));
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let mut config = PipelineConfig::default();
        let err = config
            .apply_env(env(&[("SENSOR_INTERVAL_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "SENSOR_INTERVAL_SECS",
                ..
            }
        ));

        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[("STORE_TOKEN", "t"), ("HIGH_WATER_MARK", "0")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                key: "HIGH_WATER_MARK",
                ..
            })
        ));

        let mut config = PipelineConfig::default();
        config
            .apply_env(env(&[("STORE_TOKEN", "t"), ("STORE_URL", "ftp://store")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "STORE_URL", .. })
        ));
    }

    #[test]
    fn json_file_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edgesense.json");
        fs::write(
            &path,
            r#"{ "device_id": "tank-3", "camera": { "interval_secs": 120 } }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.device_id, "tank-3");
        assert_eq!(config.camera.interval_secs, 120);
        assert_eq!(config.camera.device, "0");
        assert_eq!(config.sensor.interval_secs, 5);
    }
}

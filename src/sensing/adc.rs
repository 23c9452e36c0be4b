//! Analog front end: the MCP3008 exposed through the kernel IIO driver, the
//! probe conversion curves, and the water temperature probe.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::sensor::SensorFault;

const ADC_CHANNELS: u8 = 8;
const ADC_MAX_RAW: u16 = 1023;

const PH_NEUTRAL_VOLTAGE: f64 = 2.5;
const PH_VOLTS_PER_UNIT: f64 = 0.18;
const TEMP_COEFFICIENT: f64 = 0.02;
const TDS_FACTOR: f64 = 0.67;

const SIMULATED_BASE_CELSIUS: f64 = 25.0;
const SIMULATED_SPREAD_CELSIUS: f64 = 1.5;

pub trait AdcReader: Send {
    fn read_raw(&mut self, channel: u8) -> Result<u16, SensorFault>;
}

/// Reads `in_voltage<N>_raw` attributes of an IIO device directory.
pub struct IioAdc {
    device_dir: PathBuf,
}

impl IioAdc {
    pub fn new(device_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_dir: device_dir.into(),
        }
    }

    fn channel_path(&self, channel: u8) -> PathBuf {
        self.device_dir.join(format!("in_voltage{channel}_raw"))
    }
}

impl AdcReader for IioAdc {
    fn read_raw(&mut self, channel: u8) -> Result<u16, SensorFault> {
        if channel >= ADC_CHANNELS {
            return Err(SensorFault::Bus(format!(
                "ADC channel {channel} does not exist (0-{})",
                ADC_CHANNELS - 1
            )));
        }

        let path = self.channel_path(channel);
        let text = fs::read_to_string(&path)
            .map_err(|err| SensorFault::Bus(format!("read {}: {err}", path.display())))?;
        let raw: u16 = text.trim().parse().map_err(|_| {
            SensorFault::Bus(format!("{} holds non-numeric {:?}", path.display(), text.trim()))
        })?;

        if raw > ADC_MAX_RAW {
            return Err(SensorFault::OutOfRange {
                quantity: "adc_raw",
                value: f64::from(raw),
            });
        }
        Ok(raw)
    }
}

pub fn raw_to_voltage(raw: u16, vref: f64) -> f64 {
    f64::from(raw) / f64::from(ADC_MAX_RAW) * vref
}

pub fn ph_from_voltage(voltage: f64) -> f64 {
    round2(7.0 + (PH_NEUTRAL_VOLTAGE - voltage) / PH_VOLTS_PER_UNIT)
}

/// Gravity TDS curve with linear temperature compensation to 25 °C.
pub fn tds_from_voltage(voltage: f64, temperature: f64) -> f64 {
    let ec = (133.42 * voltage.powi(3) - 255.86 * voltage.powi(2) + 857.39 * voltage) * 0.5;
    let compensated = ec / (1.0 + TEMP_COEFFICIENT * (temperature - 25.0));
    round2(compensated * TDS_FACTOR)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub trait TemperatureProbe: Send {
    fn read_celsius(&mut self) -> Result<f64, SensorFault>;
}

/// DS18B20 on the 1-wire bus (`/sys/bus/w1/devices/28-*/w1_slave`).
pub struct W1Thermometer {
    path: PathBuf,
}

impl W1Thermometer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TemperatureProbe for W1Thermometer {
    fn read_celsius(&mut self) -> Result<f64, SensorFault> {
        let text = fs::read_to_string(&self.path)
            .map_err(|err| SensorFault::Bus(format!("read {}: {err}", self.path.display())))?;
        parse_w1_slave(&text)
    }
}

/// Parses the two-line `w1_slave` format:
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(text: &str) -> Result<f64, SensorFault> {
    let mut lines = text.lines();
    let status = lines
        .next()
        .ok_or_else(|| SensorFault::Bus("empty 1-wire reading".into()))?;
    if !status.trim_end().ends_with("YES") {
        return Err(SensorFault::Bus("1-wire CRC check failed".into()));
    }

    let data = lines
        .next()
        .ok_or_else(|| SensorFault::Bus("1-wire reading has no data line".into()))?;
    let (_, millis) = data
        .rsplit_once("t=")
        .ok_or_else(|| SensorFault::Bus("1-wire data line has no t= field".into()))?;
    let millis: i64 = millis
        .trim()
        .parse()
        .map_err(|_| SensorFault::Bus(format!("1-wire temperature {millis:?} is not numeric")))?;

    Ok(millis as f64 / 1000.0)
}

/// Stand-in probe for rigs without a thermometer: 25 °C ± 1.5, uniform.
pub struct SimulatedProbe {
    rng: StdRng,
}

impl SimulatedProbe {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for SimulatedProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl TemperatureProbe for SimulatedProbe {
    fn read_celsius(&mut self) -> Result<f64, SensorFault> {
        let offset = self
            .rng
            .gen_range(-SIMULATED_SPREAD_CELSIUS..=SIMULATED_SPREAD_CELSIUS);
        Ok(round2(SIMULATED_BASE_CELSIUS + offset))
    }
}

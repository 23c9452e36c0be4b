use thiserror::Error;

use crate::config::PipelineConfig;
use crate::models::{ModelError, Reading};
use crate::utils::MonotonicClock;

use super::adc::{
    ph_from_voltage, raw_to_voltage, tds_from_voltage, AdcReader, IioAdc, SimulatedProbe,
    TemperatureProbe, W1Thermometer,
};

const PH_RANGE: (f64, f64) = (0.0, 14.0);
const TDS_RANGE_PPM: (f64, f64) = (0.0, 5000.0);
const TEMP_RANGE_CELSIUS: (f64, f64) = (-10.0, 85.0);

#[derive(Debug, Error)]
pub enum SensorFault {
    #[error("sensor bus error: {0}")]
    Bus(String),
    #[error("{quantity} reading {value} is outside the plausible range")]
    OutOfRange { quantity: &'static str, value: f64 },
    #[error(transparent)]
    Invalid(#[from] ModelError),
}

/// Blocking sensor read. Called from a blocking worker, never on the runtime.
pub trait SensorSource: Send {
    fn poll(&mut self) -> Result<Reading, SensorFault>;
}

/// pH and TDS probes on two ADC channels plus a temperature probe.
pub struct AnalogProbeSource {
    device_id: String,
    adc: Box<dyn AdcReader>,
    thermometer: Box<dyn TemperatureProbe>,
    ph_channel: u8,
    tds_channel: u8,
    vref: f64,
    clock: MonotonicClock,
}

impl AnalogProbeSource {
    pub fn new(
        device_id: impl Into<String>,
        adc: Box<dyn AdcReader>,
        thermometer: Box<dyn TemperatureProbe>,
        ph_channel: u8,
        tds_channel: u8,
        vref: f64,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            adc,
            thermometer,
            ph_channel,
            tds_channel,
            vref,
            clock: MonotonicClock::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        let sensor = &config.sensor;
        let thermometer: Box<dyn TemperatureProbe> = match &sensor.w1_temp_path {
            Some(path) => Box::new(W1Thermometer::new(path)),
            None => Box::new(SimulatedProbe::new()),
        };

        Self::new(
            config.device_id.clone(),
            Box::new(IioAdc::new(&sensor.iio_device_dir)),
            thermometer,
            sensor.ph_channel,
            sensor.tds_channel,
            sensor.adc_vref,
        )
    }
}

impl SensorSource for AnalogProbeSource {
    fn poll(&mut self) -> Result<Reading, SensorFault> {
        let temperature = self.thermometer.read_celsius()?;
        check_range("temperature", temperature, TEMP_RANGE_CELSIUS)?;

        let ph_voltage = raw_to_voltage(self.adc.read_raw(self.ph_channel)?, self.vref);
        let tds_voltage = raw_to_voltage(self.adc.read_raw(self.tds_channel)?, self.vref);

        let ph = ph_from_voltage(ph_voltage);
        check_range("ph", ph, PH_RANGE)?;
        let tds = tds_from_voltage(tds_voltage, temperature);
        check_range("tds", tds, TDS_RANGE_PPM)?;

        let captured_at = self.clock.now();
        Ok(Reading::new(
            self.device_id.clone(),
            captured_at,
            temperature,
            ph,
            tds,
        )?)
    }
}

fn check_range(quantity: &'static str, value: f64, (min, max): (f64, f64)) -> Result<(), SensorFault> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(SensorFault::OutOfRange { quantity, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedAdc(Vec<u16>);

    impl AdcReader for FixedAdc {
        fn read_raw(&mut self, channel: u8) -> Result<u16, SensorFault> {
            self.0
                .get(usize::from(channel))
                .copied()
                .ok_or_else(|| SensorFault::Bus(format!("no channel {channel}")))
        }
    }

    struct FixedProbe(f64);

    impl TemperatureProbe for FixedProbe {
        fn read_celsius(&mut self) -> Result<f64, SensorFault> {
            Ok(self.0)
        }
    }

    fn source(raw: Vec<u16>, temperature: f64) -> AnalogProbeSource {
        AnalogProbeSource::new(
            "raspi-01",
            Box::new(FixedAdc(raw)),
            Box::new(FixedProbe(temperature)),
            0,
            1,
            3.3,
        )
    }

    #[test]
    fn poll_converts_both_channels() {
        // 775/1023 * 3.3 ≈ 2.5 V on the pH channel.
        let mut src = source(vec![775, 310], 25.0);
        let reading = src.poll().unwrap();

        assert_eq!(reading.device_id(), "raspi-01");
        assert_eq!(reading.temperature(), 25.0);
        assert!((reading.ph() - 7.0).abs() < 0.05);
        assert!(reading.tds() > 0.0);
    }

    #[test]
    fn implausible_temperature_is_out_of_range() {
        let mut src = source(vec![775, 310], 120.0);
        assert!(matches!(
            src.poll(),
            Err(SensorFault::OutOfRange {
                quantity: "temperature",
                ..
            })
        ));
    }

    #[test]
    fn grounded_ph_probe_is_out_of_range() {
        // 0 V reads pH ≈ 20.9.
        let mut src = source(vec![0, 310], 25.0);
        assert!(matches!(
            src.poll(),
            Err(SensorFault::OutOfRange { quantity: "ph", .. })
        ));
    }

    #[test]
    fn missing_channel_is_a_bus_fault() {
        let mut src = source(vec![775], 25.0);
        assert!(matches!(src.poll(), Err(SensorFault::Bus(_))));
    }

    #[test]
    fn capture_times_never_decrease() {
        let mut src = source(vec![775, 310], 25.0);
        let first = src.poll().unwrap().captured_at();
        let second = src.poll().unwrap().captured_at();
        assert!(second >= first);
    }
}

//! Acquisition devices: analog water probes and the camera.

pub mod adc;
pub mod archive;
pub mod camera;
pub mod health;
pub mod sensor;

pub use archive::FrameArchive;
pub use camera::{CaptureFault, CommandCamera, ImageSource};
pub use health::{FaultTracker, HealthTransition};
pub use sensor::{AnalogProbeSource, SensorFault, SensorSource};

//! Edge-side capture: sensors, the adaptive sampling controller and the
//! engine that turns due captures into codec frames.

pub mod engine;
pub mod sampling;
pub mod sensor;

pub use engine::{CaptureError, CapturedFrame, EdgeDevice, Engine};
pub use sampling::{
    FieldConditions, SampleDecision, SampleReason, SamplingConfig, SamplingConfigError,
    SamplingController,
};
pub use sensor::{Sensor, SensorError, SimulatedSensor};

use loam_core::ChannelKind;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("sensor timed out")]
    Timeout,
    #[error("sensor returned invalid data")]
    InvalidData,
}

/// A single measurement channel on a field device.
pub trait Sensor: Send {
    fn kind(&self) -> ChannelKind;
    fn read(&mut self) -> Result<f64, SensorError>;
}

/// Random-walk sensor used by the simulated fleet.
#[derive(Debug)]
pub struct SimulatedSensor {
    kind: ChannelKind,
    value: f64,
    step: f64,
    range: (f64, f64),
    failure_rate: f64,
    rng: StdRng,
}

impl SimulatedSensor {
    pub fn new(kind: ChannelKind, seed: u64) -> Self {
        let (value, step, range) = match kind {
            ChannelKind::Moisture => (32.0, 0.4, (0.0, 100.0)),
            ChannelKind::Temperature => (18.0, 0.2, (-20.0, 60.0)),
            ChannelKind::Conductivity => (1.2, 0.05, (0.0, 20.0)),
            ChannelKind::Ph => (6.5, 0.02, (0.0, 14.0)),
            ChannelKind::Battery => (4.1, 0.005, (3.0, 4.2)),
            ChannelKind::Rainfall => (0.0, 0.5, (0.0, 200.0)),
        };

        Self {
            kind,
            value,
            step,
            range,
            failure_rate: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Fraction of reads that fail with [`SensorError::Timeout`].
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Calibration offset applied to the current value.
    pub fn calibrate(mut self, offset: f64) -> Self {
        self.value = (self.value + offset).clamp(self.range.0, self.range.1);
        self
    }
}

impl Sensor for SimulatedSensor {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn read(&mut self) -> Result<f64, SensorError> {
        if self.failure_rate > 0.0 && self.rng.random_bool(self.failure_rate) {
            return Err(SensorError::Timeout);
        }

        let step = self.rng.random_range(-self.step..=self.step);
        self.value = (self.value + step).clamp(self.range.0, self.range.1);
        Ok(self.value)
    }
}

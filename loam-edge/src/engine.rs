use std::sync::Arc;
use std::time::Instant;

use loam_core::codec::{CodecError, DeltaEncoder};
use loam_core::{
    ChannelKind, ChannelValue, DeviceId, DeviceTimestamp, FieldId, Percentage, Reading,
    ReadingError,
};

use crate::sampling::{SampleDecision, SamplingController};
use crate::sensor::Sensor;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("device {0:?} has no working sensor")]
    NoReadings(DeviceId),
    #[error(transparent)]
    Reading(#[from] ReadingError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A field device: a set of sensors planted at one spot of a field.
pub struct EdgeDevice {
    pub device_id: DeviceId,
    pub field_id: FieldId,
    pub depth_index: Option<u8>,
    sensors: Vec<Box<dyn Sensor>>,
    battery: Percentage,
}

impl EdgeDevice {
    pub fn new(device_id: DeviceId, field_id: FieldId) -> Self {
        Self {
            device_id,
            field_id,
            depth_index: None,
            sensors: Vec::new(),
            battery: Percentage(100),
        }
    }

    pub fn with_sensor(mut self, sensor: impl Sensor + 'static) -> Self {
        self.sensors.push(Box::new(sensor));
        self
    }

    pub fn with_depth(mut self, depth_index: u8) -> Self {
        self.depth_index = Some(depth_index);
        self
    }

    pub fn battery(&self) -> Percentage {
        self.battery
    }

    pub fn set_battery(&mut self, level: Percentage) {
        self.battery = Percentage(level.0.min(100));
    }

    /// Read every sensor once. Failed sensors are left out of the reading.
    pub fn capture(&mut self, timestamp: DeviceTimestamp) -> Result<Reading, CaptureError> {
        let mut channels = Vec::with_capacity(self.sensors.len());

        for sensor in &mut self.sensors {
            let kind = sensor.kind();
            match sensor.read() {
                Ok(value) => channels.push(ChannelValue::new(kind, value)?),
                Err(e) => {
                    tracing::warn!(device_id = self.device_id.0, ?kind, "sensor read failed: {e}")
                }
            }
        }

        if channels.is_empty() {
            return Err(CaptureError::NoReadings(self.device_id));
        }

        // Battery voltage maps onto the charge level the sampling policy sees.
        if let Some(volts) = channels
            .iter()
            .find(|c| c.kind == ChannelKind::Battery)
            .map(|c| c.value.into_inner())
        {
            let level = ((volts - 3.0) / 1.2 * 100.0).clamp(0.0, 100.0);
            self.battery = Percentage(level.round() as u8);
        }

        Ok(Reading::new(
            self.device_id,
            self.field_id,
            timestamp,
            channels,
            self.depth_index,
        )?)
    }
}

/// One encoded frame ready for batching.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub device_id: DeviceId,
    pub timestamp: DeviceTimestamp,
    pub decision: SampleDecision,
    pub bytes: Vec<u8>,
}

/// Drives a set of devices: captures whoever is due, encodes the reading and
/// schedules the next capture.
pub struct Engine {
    controller: Arc<SamplingController>,
    encoder: Arc<DeltaEncoder>,
    devices: Vec<EdgeDevice>,
    booted_at: Instant,
}

impl Engine {
    pub fn new(controller: Arc<SamplingController>, encoder: Arc<DeltaEncoder>) -> Self {
        Self {
            controller,
            encoder,
            devices: Vec::new(),
            booted_at: Instant::now(),
        }
    }

    pub fn add_device(&mut self, device: EdgeDevice) {
        self.devices.push(device);
    }

    pub fn devices(&self) -> &[EdgeDevice] {
        &self.devices
    }

    pub fn encoder(&self) -> &DeltaEncoder {
        &self.encoder
    }

    /// Capture and encode every device whose slot has arrived at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<CapturedFrame> {
        let timestamp = DeviceTimestamp(now.saturating_duration_since(self.booted_at).as_millis() as u64);
        let mut frames = Vec::new();

        for device in &mut self.devices {
            if !self.controller.due(device.device_id, now) {
                continue;
            }

            let captured = device
                .capture(timestamp)
                .and_then(|reading| Ok(self.encoder.encode(device.device_id, &reading)?));

            self.controller.update_battery(device.device_id, device.battery());
            let decision = self.controller.schedule(device.device_id, device.field_id, now);

            match captured {
                Ok(bytes) => frames.push(CapturedFrame {
                    device_id: device.device_id,
                    timestamp,
                    decision,
                    bytes,
                }),
                Err(e) => tracing::warn!(device_id = device.device_id.0, "capture failed: {e}"),
            }
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use loam_core::codec::{CodecConfig, Frame};

    use super::*;
    use crate::sampling::{FieldConditions, SampleReason, SamplingConfig};
    use crate::sensor::{SensorError, SimulatedSensor};

    struct Fixed(ChannelKind, f64);

    impl Sensor for Fixed {
        fn kind(&self) -> ChannelKind {
            self.0
        }

        fn read(&mut self) -> Result<f64, SensorError> {
            Ok(self.1)
        }
    }

    struct Broken;

    impl Sensor for Broken {
        fn kind(&self) -> ChannelKind {
            ChannelKind::Ph
        }

        fn read(&mut self) -> Result<f64, SensorError> {
            Err(SensorError::InvalidData)
        }
    }

    fn engine() -> Engine {
        let controller = SamplingController::new(SamplingConfig::default()).unwrap();
        Engine::new(
            Arc::new(controller),
            Arc::new(DeltaEncoder::new(CodecConfig::default())),
        )
    }

    #[test]
    fn failed_sensors_are_skipped() {
        let mut device = EdgeDevice::new(DeviceId(1), FieldId(1))
            .with_sensor(Fixed(ChannelKind::Moisture, 30.0))
            .with_sensor(Broken);

        let reading = device.capture(DeviceTimestamp(0)).unwrap();
        assert_eq!(reading.channels.len(), 1);

        let mut dead = EdgeDevice::new(DeviceId(2), FieldId(1)).with_sensor(Broken);
        assert!(matches!(
            dead.capture(DeviceTimestamp(0)),
            Err(CaptureError::NoReadings(DeviceId(2)))
        ));
    }

    #[test]
    fn battery_channel_drives_level() {
        let mut device = EdgeDevice::new(DeviceId(1), FieldId(1))
            .with_sensor(Fixed(ChannelKind::Battery, 3.12));
        device.capture(DeviceTimestamp(0)).unwrap();
        assert_eq!(device.battery(), Percentage(10));
    }

    #[test]
    fn poll_respects_schedule() {
        let mut engine = engine();
        engine.add_device(
            EdgeDevice::new(DeviceId(1), FieldId(1))
                .with_sensor(SimulatedSensor::new(ChannelKind::Moisture, 1)),
        );

        let now = Instant::now();
        let first = engine.poll(now);
        assert_eq!(first.len(), 1);
        assert!(matches!(Frame::parse(&first[0].bytes).unwrap(), Frame::Full(_)));
        assert_eq!(first[0].decision.reason, SampleReason::Nominal);

        assert!(engine.poll(now + Duration::from_secs(10)).is_empty());

        let second = engine.poll(now + Duration::from_secs(900));
        assert_eq!(second.len(), 1);
        assert!(matches!(Frame::parse(&second[0].bytes).unwrap(), Frame::Delta(_)));
    }

    #[test]
    fn low_battery_device_backs_off() {
        let controller = Arc::new(SamplingController::new(SamplingConfig::default()).unwrap());
        controller.update_field_conditions(FieldId(1), FieldConditions::new(true, false));
        let mut engine = Engine::new(
            controller.clone(),
            Arc::new(DeltaEncoder::new(CodecConfig::default())),
        );
        engine.add_device(
            EdgeDevice::new(DeviceId(1), FieldId(1))
                .with_sensor(Fixed(ChannelKind::Battery, 3.05)),
        );

        let frames = engine.poll(Instant::now());
        assert_eq!(frames[0].decision.reason, SampleReason::LowBattery);
        assert!(frames[0].decision.emergency);
    }
}

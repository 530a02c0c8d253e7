use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use loam_core::codec::{self, DeltaEncoder};
use loam_core::{Attestation, ChannelKind, DeviceId, FieldId, Priority};
use loam_edge::{CapturedFrame, EdgeDevice, Engine, SamplingController, SimulatedSensor};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EdgeBatch, EdgeSource};

const CHANNELS: [ChannelKind; 4] = [
    ChannelKind::Moisture,
    ChannelKind::Temperature,
    ChannelKind::Conductivity,
    ChannelKind::Battery,
];

/// Simulated fleet of field devices driven by the edge engine.
pub struct MockFleet {
    controller: Arc<SamplingController>,
    encoder: Arc<DeltaEncoder>,
    engine: Mutex<Option<Engine>>,
    poll_interval: Duration,
    max_batch: usize,
}

impl MockFleet {
    pub fn new(
        controller: Arc<SamplingController>,
        encoder: Arc<DeltaEncoder>,
        device_count: u32,
        field_count: u32,
        poll_interval: Duration,
    ) -> Self {
        let mut engine = Engine::new(controller.clone(), encoder.clone());
        let field_count = field_count.max(1);

        for i in 0..device_count {
            let device_id = DeviceId(1000 + i);
            let field_id = FieldId(1 + i % field_count);
            let device = CHANNELS.iter().enumerate().fold(
                EdgeDevice::new(device_id, field_id).with_depth((i % 3) as u8),
                |device, (n, kind)| {
                    let seed = (u64::from(device_id.0) << 8) | n as u64;
                    device.with_sensor(SimulatedSensor::new(*kind, seed).with_failure_rate(0.01))
                },
            );
            engine.add_device(device);
        }

        Self {
            controller,
            encoder,
            engine: Mutex::new(Some(engine)),
            poll_interval,
            max_batch: 64,
        }
    }

    /// Upper bound on frames per batch.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn controller(&self) -> &Arc<SamplingController> {
        &self.controller
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MockFleetError {
    #[error("fleet already started")]
    AlreadyStarted,
}

#[async_trait]
impl EdgeSource for MockFleet {
    type Error = MockFleetError;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EdgeBatch>, Self::Error> {
        let mut engine = self
            .engine
            .lock()
            .ok()
            .and_then(|mut e| e.take())
            .ok_or(MockFleetError::AlreadyStarted)?;

        let (tx, rx) = mpsc::channel(64);
        let poll_interval = self.poll_interval;
        let max_batch = self.max_batch;

        info!(
            devices = engine.devices().len(),
            poll_interval_ms = poll_interval.as_millis() as u64,
            "starting simulated fleet"
        );

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("simulated fleet shutting down");
                        break;
                    }
                    _ = tick.tick() => {}
                }

                let frames = engine.poll(Instant::now());
                if frames.is_empty() {
                    continue;
                }
                debug!(frames = frames.len(), "captured frames");

                // Devices on their last reserves go out ahead of routine telemetry.
                let (emergency, routine): (Vec<_>, Vec<_>) =
                    frames.into_iter().partition(|f| f.decision.emergency);

                for (priority, frames) in [(Priority::Emergency, emergency), (Priority::Telemetry, routine)] {
                    for chunk in frames.chunks(max_batch) {
                        match batch(chunk, priority) {
                            Ok(batch) => {
                                if tx.send(batch).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("failed to pack batch: {e}"),
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    fn request_full(&self, devices: &[DeviceId]) {
        for device in devices {
            self.encoder.request_full(*device);
        }
    }
}

fn batch(frames: &[CapturedFrame], priority: Priority) -> codec::CodecResult<EdgeBatch> {
    let packed = codec::pack_frames(&frames.iter().map(|f| &f.bytes).collect::<Vec<_>>())?;

    Ok(EdgeBatch {
        frames: packed,
        devices: frames.iter().map(|f| f.device_id).collect(),
        attestations: frames.iter().map(attest).collect(),
        priority,
    })
}

/// Stand-in for sensor-side signing: FNV-1a over the frame bytes.
fn attest(frame: &CapturedFrame) -> Attestation {
    let hash = frame
        .bytes
        .iter()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
        });

    Attestation {
        device_id: frame.device_id,
        timestamp: frame.timestamp,
        content_hash: format!("{hash:016x}").into(),
        signature: "unsigned".into(),
    }
}

#[cfg(test)]
mod tests {
    use loam_core::codec::{CodecConfig, DeltaDecoder};
    use loam_edge::SamplingConfig;

    use super::*;

    fn fleet(devices: u32) -> MockFleet {
        let controller = Arc::new(SamplingController::new(SamplingConfig::default()).unwrap());
        let encoder = Arc::new(DeltaEncoder::new(CodecConfig::default()));
        MockFleet::new(controller, encoder, devices, 2, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn first_poll_captures_every_device() {
        let fleet = fleet(5);
        let cancel = CancellationToken::new();
        let mut rx = fleet.start(cancel.clone()).await.unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.priority, Priority::Telemetry);
        assert_eq!(batch.devices.len(), 5);
        assert_eq!(batch.attestations.len(), 5);

        let decoder = DeltaDecoder::new();
        let readings = decoder.decode_batch(&batch.frames).unwrap();
        assert!(readings.iter().all(Result::is_ok));

        assert!(matches!(
            fleet.start(cancel.clone()).await,
            Err(MockFleetError::AlreadyStarted)
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let fleet = fleet(5).with_max_batch(2);
        let cancel = CancellationToken::new();
        let mut rx = fleet.start(cancel.clone()).await.unwrap();

        let sizes = [
            rx.recv().await.unwrap().devices.len(),
            rx.recv().await.unwrap().devices.len(),
            rx.recv().await.unwrap().devices.len(),
        ];
        assert_eq!(sizes, [2, 2, 1]);
        cancel.cancel();
    }
}

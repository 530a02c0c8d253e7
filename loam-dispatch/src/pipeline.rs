use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use loam_core::{Priority, TelemetryPayload, UploadPayload};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::edge::{EdgeBatch, EdgeSource};
use crate::transport::{Transport, TransportError};

/// Counters for traffic moved from the fleet to the transport.
#[derive(Debug, Default)]
pub struct PipelineStats {
    batches: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    resync_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineSnapshot {
    pub batches: u64,
    pub delivered: u64,
    pub failed: u64,
    pub resync_requests: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            resync_requests: self.resync_requests.load(Ordering::Relaxed),
        }
    }
}

/// Hand every edge batch to the transport and feed delivery results back to
/// the encoders.
///
/// A delivered batch may name devices the receiver could not decode; a batch
/// that failed for good broke the delta chain of every device in it. Both
/// cases force full frames.
pub async fn run_pipeline<E: EdgeSource>(
    source: Arc<E>,
    mut batches: mpsc::Receiver<EdgeBatch>,
    transport: Transport,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
) {
    info!("pipeline started");

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        stats.batches.fetch_add(1, Ordering::Relaxed);
        let devices = batch.devices.clone();
        let priority = batch.priority;

        let payload = UploadPayload::Telemetry(TelemetryPayload {
            frames: batch.frames.into_boxed_slice(),
            attestations: batch.attestations.into_boxed_slice(),
        });
        let bytes = match postcard::to_allocvec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode telemetry payload: {e}");
                stats.failed.fetch_add(1, Ordering::Relaxed);
                source.request_full(&devices);
                continue;
            }
        };

        let ticket = match transport.enqueue(bytes.clone(), priority) {
            Err(TransportError::QueueFull { .. }) => {
                // Make room at the bottom before giving up on this batch.
                match transport.shed(Priority::Bulk) {
                    Some(shed) => {
                        debug!(message_id = %shed, "shed bulk message for telemetry");
                        transport.enqueue(bytes, priority)
                    }
                    None => Err(TransportError::QueueFull { priority }),
                }
            }
            other => other,
        };

        let ticket = match ticket {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(devices = devices.len(), "batch not queued: {e}");
                stats.failed.fetch_add(1, Ordering::Relaxed);
                stats
                    .resync_requests
                    .fetch_add(devices.len() as u64, Ordering::Relaxed);
                source.request_full(&devices);
                continue;
            }
        };

        let source = source.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            let id = ticket.id();
            match ticket.outcome().await {
                Ok(delivery) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if !delivery.resync.is_empty() {
                        debug!(message_id = %id, devices = delivery.resync.len(), "receiver asked for full frames");
                        stats
                            .resync_requests
                            .fetch_add(delivery.resync.len() as u64, Ordering::Relaxed);
                        source.request_full(&delivery.resync);
                    }
                }
                Err(e) => {
                    warn!(message_id = %id, devices = devices.len(), "batch lost: {e}");
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    stats
                        .resync_requests
                        .fetch_add(devices.len() as u64, Ordering::Relaxed);
                    source.request_full(&devices);
                }
            }
        });
    }

    info!("pipeline stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use loam_core::{AckStatus, DeviceId, EndpointId, ShardUpload, UploadAck};

    use super::*;
    use crate::gate::WriteGate;
    use crate::transport::TransportConfig;
    use crate::transport::backhaul::{Backhaul, LinkError, MockBackhaul, MockLinkMode};

    #[derive(Default)]
    struct RecordingSource {
        full: Mutex<Vec<DeviceId>>,
    }

    #[async_trait]
    impl EdgeSource for RecordingSource {
        type Error = std::io::Error;

        async fn start(
            &self,
            _cancel: CancellationToken,
        ) -> Result<mpsc::Receiver<EdgeBatch>, Self::Error> {
            Err(std::io::Error::other("batches are fed by the test"))
        }

        fn request_full(&self, devices: &[DeviceId]) {
            self.full.lock().unwrap().extend_from_slice(devices);
        }
    }

    /// Receiver that could not decode device 7.
    struct ResyncLink;

    #[async_trait]
    impl Backhaul for ResyncLink {
        async fn send(&self, upload: ShardUpload) -> Result<UploadAck, LinkError> {
            Ok(UploadAck {
                message_id: upload.message_id,
                status: AckStatus::Delivered {
                    resync: Box::new([DeviceId(7)]),
                },
            })
        }
    }

    fn batch(devices: &[u32]) -> EdgeBatch {
        EdgeBatch {
            frames: vec![0xAB; 16],
            devices: devices.iter().copied().map(DeviceId).collect(),
            attestations: Vec::new(),
            priority: Priority::Telemetry,
        }
    }

    async fn run(
        link: Arc<dyn Backhaul>,
        batches: Vec<EdgeBatch>,
    ) -> (Arc<RecordingSource>, PipelineSnapshot) {
        let mut config = TransportConfig::default();
        config.retry.base_ms = 1;
        config.retry.cap_ms = 2;
        config.retry.max_attempts = 2;
        let links = vec![(EndpointId(1), "uplink".into(), link)];
        let transport = Transport::new(config, links, WriteGate::default()).unwrap();
        let cancel = CancellationToken::new();
        let _tasks = transport.start(cancel.clone());

        let source = Arc::new(RecordingSource::default());
        let stats = Arc::new(PipelineStats::default());
        let (tx, rx) = mpsc::channel(8);
        let count = batches.len() as u64;
        for batch in batches {
            tx.send(batch).await.unwrap();
        }
        drop(tx);

        run_pipeline(source.clone(), rx, transport, stats.clone(), cancel.clone()).await;
        while {
            let s = stats.snapshot();
            s.delivered + s.failed < count
        } {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let snapshot = stats.snapshot();
        (source, snapshot)
    }

    #[tokio::test]
    async fn resync_list_forces_full_frames() {
        let (source, stats) = run(Arc::new(ResyncLink), vec![batch(&[5, 6, 7])]).await;

        assert_eq!(stats.batches, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(*source.full.lock().unwrap(), vec![DeviceId(7)]);
    }

    #[tokio::test]
    async fn lost_batch_resets_every_device_in_it() {
        let link = Arc::new(MockBackhaul::new(MockLinkMode::Down));
        let (source, stats) = run(link, vec![batch(&[1, 2]), batch(&[3])]).await;

        assert_eq!(stats.failed, 2);
        assert_eq!(stats.resync_requests, 3);
        let mut full = source.full.lock().unwrap().clone();
        full.sort();
        assert_eq!(full, vec![DeviceId(1), DeviceId(2), DeviceId(3)]);
    }
}

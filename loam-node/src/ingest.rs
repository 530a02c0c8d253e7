use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use loam_core::codec::{CodecError, DeltaDecoder};
use loam_core::{
    AckStatus, Attestation, DeviceId, DeviceTimestamp, MessageId, MirrorSyncRequest, NodeId,
    ShardUpload, StorageRow, TelemetryPayload, TenantId, UploadAck, UploadPayload, fec,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::mirror;
use crate::storage::RowStorage;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to store rows: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, Default)]
pub struct IngestStats {
    uploads: AtomicU64,
    unrecoverable: AtomicU64,
    readings: AtomicU64,
    rows: AtomicU64,
    rejected_frames: AtomicU64,
    resync_requests: AtomicU64,
    mirror_syncs: AtomicU64,
    /// Updated by background sync tasks.
    mirrored_rows: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub uploads: u64,
    pub unrecoverable: u64,
    pub readings: u64,
    pub rows: u64,
    pub rejected_frames: u64,
    pub resync_requests: u64,
    pub mirror_syncs: u64,
    pub mirrored_rows: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            uploads: self.uploads.load(Ordering::Relaxed),
            unrecoverable: self.unrecoverable.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            resync_requests: self.resync_requests.load(Ordering::Relaxed),
            mirror_syncs: self.mirror_syncs.load(Ordering::Relaxed),
            mirrored_rows: self.mirrored_rows.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of the backhaul: rebuilds uploads, decodes frames and
/// stores one row per channel value.
pub struct Ingestor<R> {
    node_id: NodeId,
    tenant: TenantId,
    decoder: DeltaDecoder,
    storage: R,
    stats: IngestStats,
    mirror: MirrorConfig,
    /// Set while a mirror sync pulls from the primary.
    syncing: Arc<AtomicBool>,
}

impl<R: RowStorage> Ingestor<R> {
    pub fn new(node_id: NodeId, tenant: TenantId, storage: R) -> Self {
        Self {
            node_id,
            tenant,
            decoder: DeltaDecoder::new(),
            storage,
            stats: IngestStats::default(),
            mirror: MirrorConfig::default(),
            syncing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_mirror(mut self, mirror: MirrorConfig) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn storage(&self) -> &R {
        &self.storage
    }

    pub fn stats(&self) -> IngestSnapshot {
        self.stats.snapshot()
    }

    pub fn tracked_devices(&self) -> usize {
        self.decoder.tracked_devices()
    }

    /// Handle one upload.
    ///
    /// Lost shards beyond what the parity can rebuild, and payloads that do
    /// not parse, are acknowledged as unrecoverable. Only a storage failure
    /// is an error; the sender treats it as a failed attempt and retries.
    pub async fn handle(&self, upload: ShardUpload) -> Result<UploadAck, IngestError> {
        self.stats.uploads.fetch_add(1, Ordering::Relaxed);
        let message_id = upload.message_id;

        let bytes = match fec::reconstruct(&upload.layout, &upload.shards) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%message_id, error = %e, "upload could not be reconstructed");
                return Ok(self.unrecoverable(message_id, e.to_string()));
            }
        };

        let payload: UploadPayload = match postcard::from_bytes(&bytes) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%message_id, error = %e, "malformed upload payload");
                return Ok(self.unrecoverable(message_id, format!("malformed payload: {e}")));
            }
        };

        let status = match payload {
            UploadPayload::Telemetry(telemetry) => self.ingest_telemetry(telemetry).await?,
            UploadPayload::MirrorSync(request) => self.mirror_sync(request),
        };

        Ok(UploadAck { message_id, status })
    }

    async fn ingest_telemetry(&self, payload: TelemetryPayload) -> Result<AckStatus, IngestError> {
        let results = match self.decoder.decode_batch(&payload.frames) {
            Ok(results) => results,
            Err(e) => {
                self.stats.unrecoverable.fetch_add(1, Ordering::Relaxed);
                return Ok(AckStatus::Unrecoverable {
                    reason: format!("malformed batch: {e}").into(),
                });
            }
        };

        let attestations: HashMap<(DeviceId, DeviceTimestamp), &Attestation> = payload
            .attestations
            .iter()
            .map(|a| ((a.device_id, a.timestamp), a))
            .collect();

        let ingested_at = jiff::Timestamp::now();
        let mut rows = Vec::new();
        let mut devices = BTreeSet::new();
        let mut resync = BTreeSet::new();
        let mut readings = 0u64;
        let mut rejected = 0u64;

        for result in results {
            match result {
                Ok(reading) => {
                    let attestation = attestations
                        .get(&(reading.device_id, reading.timestamp))
                        .copied();
                    rows.extend(StorageRow::from_reading(
                        &reading,
                        &self.tenant,
                        attestation,
                        ingested_at,
                    ));
                    devices.insert(reading.device_id);
                    readings += 1;
                }
                Err(CodecError::ResyncRequired {
                    device_id,
                    expected,
                    received,
                }) => {
                    debug!(device_id = device_id.0, ?expected, received, "delta chain broken");
                    resync.insert(device_id);
                }
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    rejected += 1;
                }
            }
        }

        let stored = rows.len() as u64;
        if !rows.is_empty()
            && let Err(e) = self.storage.store_batch(rows).await
        {
            // The retried batch must not decode deltas against state that was
            // never persisted.
            for device_id in devices {
                self.decoder.reset(device_id);
            }
            return Err(IngestError::Storage(Box::new(e)));
        }

        self.stats.readings.fetch_add(readings, Ordering::Relaxed);
        self.stats.rows.fetch_add(stored, Ordering::Relaxed);
        self.stats.rejected_frames.fetch_add(rejected, Ordering::Relaxed);
        self.stats
            .resync_requests
            .fetch_add(resync.len() as u64, Ordering::Relaxed);

        debug!(readings, rows = stored, rejected, resync = resync.len(), "batch ingested");

        Ok(AckStatus::Delivered {
            resync: resync.into_iter().collect(),
        })
    }

    /// Start pulling the primary's rows unless this node already matches it.
    /// The request is acknowledged at once; the copy runs in the background
    /// and the next heartbeat reports the resulting checksum.
    fn mirror_sync(&self, request: MirrorSyncRequest) -> AckStatus {
        self.stats.mirror_syncs.fetch_add(1, Ordering::Relaxed);
        let delivered = AckStatus::Delivered {
            resync: Box::new([]),
        };
        let local = self.storage.checksum();

        if local == request.primary_checksum {
            debug!(node_id = self.node_id.0, checksum = local, "mirror already in sync");
            return delivered;
        }
        if request.primary == self.node_id {
            warn!(node_id = self.node_id.0, "mirror sync names this node as primary, ignored");
            return delivered;
        }
        let Some(primary_addr) = request.primary_addr else {
            warn!(
                node_id = self.node_id.0,
                primary = request.primary.0,
                "mirror sync without a primary address, nothing to pull from"
            );
            return delivered;
        };
        if self.syncing.swap(true, Ordering::AcqRel) {
            debug!(node_id = self.node_id.0, "mirror sync already running");
            return delivered;
        }

        info!(
            node_id = self.node_id.0,
            primary = request.primary.0,
            %primary_addr,
            primary_checksum = request.primary_checksum,
            local_checksum = local,
            "mirror sync started"
        );

        let storage = self.storage.clone();
        let config = self.mirror;
        let syncing = self.syncing.clone();
        let mirrored = self.stats.mirrored_rows.clone();
        tokio::spawn(async move {
            match mirror::pull_rows(&storage, primary_addr, &config).await {
                Ok(rows) => {
                    mirrored.fetch_add(rows, Ordering::Relaxed);
                    info!(rows, checksum = storage.checksum(), "mirror sync finished");
                }
                Err(e) => warn!(%primary_addr, error = %e, "mirror sync failed"),
            }
            syncing.store(false, Ordering::Release);
        });

        delivered
    }

    fn unrecoverable(&self, message_id: MessageId, reason: String) -> UploadAck {
        self.stats.unrecoverable.fetch_add(1, Ordering::Relaxed);
        UploadAck {
            message_id,
            status: AckStatus::Unrecoverable {
                reason: reason.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use loam_core::codec::{CodecConfig, DeltaEncoder};
    use loam_core::fec::FecConfig;
    use loam_core::{ChannelKind, ChannelValue, FieldId, Priority, Reading};

    use super::*;
    use crate::storage::MemoryRowStorage;

    fn reading(device: u32, at: u64, moisture: f64) -> Reading {
        Reading::new(
            DeviceId(device),
            FieldId(1),
            DeviceTimestamp(at),
            vec![
                ChannelValue::new(ChannelKind::Moisture, moisture).unwrap(),
                ChannelValue::new(ChannelKind::Battery, 3.6).unwrap(),
            ],
            None,
        )
        .unwrap()
    }

    fn upload(payload: &UploadPayload) -> ShardUpload {
        let bytes = postcard::to_allocvec(payload).unwrap();
        let (layout, shards) = fec::encode(&bytes, &FecConfig::default()).unwrap();
        ShardUpload {
            message_id: MessageId::new(),
            priority: Priority::Telemetry,
            layout,
            shards: shards.into_boxed_slice(),
        }
    }

    fn telemetry(frames: Vec<u8>, attestations: Vec<Attestation>) -> UploadPayload {
        UploadPayload::Telemetry(TelemetryPayload {
            frames: frames.into_boxed_slice(),
            attestations: attestations.into_boxed_slice(),
        })
    }

    fn ingestor() -> Ingestor<MemoryRowStorage> {
        Ingestor::new(NodeId(1), TenantId("farm".into()), MemoryRowStorage::new())
    }

    fn resync_of(ack: &UploadAck) -> Vec<DeviceId> {
        match &ack.status {
            AckStatus::Delivered { resync } => resync.to_vec(),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_becomes_one_row_per_channel() {
        let encoder = DeltaEncoder::new(CodecConfig::default());
        let ingestor = ingestor();
        let attestation = Attestation {
            device_id: DeviceId(1),
            timestamp: DeviceTimestamp(0),
            content_hash: "h1".into(),
            signature: "s1".into(),
        };

        let frames = encoder
            .encode_batch(&[reading(1, 0, 32.5), reading(2, 0, 40.0)])
            .unwrap();
        let ack = ingestor
            .handle(upload(&telemetry(frames, vec![attestation])))
            .await
            .unwrap();
        assert!(resync_of(&ack).is_empty());

        let rows = ingestor.storage().rows_for_device(DeviceId(1)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.content_hash.as_deref() == Some("h1")));
        assert!(rows.iter().all(|r| &*r.tenant_id.0 == "farm"));

        let other = ingestor.storage().rows_for_device(DeviceId(2)).await.unwrap();
        assert!(other.iter().all(|r| r.signature.is_none()));

        // delta frame decodes against the stored reference
        let frames = encoder.encode_batch(&[reading(1, 15_000, 32.1)]).unwrap();
        ingestor
            .handle(upload(&telemetry(frames, vec![])))
            .await
            .unwrap();
        let rows = ingestor.storage().rows_for_device(DeviceId(1)).await.unwrap();
        let moisture = rows
            .iter()
            .find(|r| {
                r.timestamp == DeviceTimestamp(15_000)
                    && r.sensor_id.channel == ChannelKind::Moisture
            })
            .unwrap();
        assert!((moisture.value - 32.1).abs() < 0.005);
        assert_eq!(ingestor.stats().rows, 6);
    }

    #[tokio::test]
    async fn unknown_delta_chain_asks_for_resync() {
        let encoder = DeltaEncoder::new(CodecConfig::default());
        encoder.encode(DeviceId(7), &reading(7, 0, 20.0)).unwrap();

        // the node never saw the full frame
        let frames = encoder.encode_batch(&[reading(7, 15_000, 20.5)]).unwrap();
        let ingestor = ingestor();
        let ack = ingestor
            .handle(upload(&telemetry(frames, vec![])))
            .await
            .unwrap();

        assert_eq!(resync_of(&ack), vec![DeviceId(7)]);
        assert_eq!(ingestor.storage().count().await.unwrap(), 0);
        assert_eq!(ingestor.stats().resync_requests, 1);
    }

    #[tokio::test]
    async fn lost_shards_are_reported_unrecoverable() {
        let encoder = DeltaEncoder::new(CodecConfig::default());
        let readings: Vec<_> = (0..20).map(|d| reading(d, 0, 30.0)).collect();
        let frames = encoder.encode_batch(&readings).unwrap();
        let mut upload = upload(&telemetry(frames, vec![]));
        assert!(upload.layout.data_shards >= 2);

        // shards 0 and parity_shards share a parity group
        let group_peer = upload.layout.parity_shards;
        upload.shards = upload
            .shards
            .iter()
            .filter(|s| s.index != 0 && s.index != group_peer)
            .cloned()
            .collect();

        let ingestor = ingestor();
        let ack = ingestor.handle(upload).await.unwrap();
        assert!(matches!(ack.status, AckStatus::Unrecoverable { .. }));
        assert_eq!(ingestor.stats().unrecoverable, 1);
        assert_eq!(ingestor.storage().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mirror_sync_without_source_starts_nothing() {
        let ingestor = ingestor();
        let request = UploadPayload::MirrorSync(MirrorSyncRequest {
            primary: NodeId(2),
            primary_checksum: 99,
            primary_addr: None,
            requested_at: jiff::Timestamp::now(),
        });
        let ack = ingestor.handle(upload(&request)).await.unwrap();
        assert!(resync_of(&ack).is_empty());
        assert_eq!(ingestor.stats().mirror_syncs, 1);
        assert!(!ingestor.is_syncing());
    }
}

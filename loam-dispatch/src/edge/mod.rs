pub mod mock;

use async_trait::async_trait;
use loam_core::{Attestation, DeviceId, Priority};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Encoded frames from the device fleet, packed into one codec batch.
#[derive(Debug, Clone)]
pub struct EdgeBatch {
    /// BATCH frame holding one FULL or DELTA frame per device.
    pub frames: Vec<u8>,
    /// Devices with a frame in `frames`, in frame order.
    pub devices: Vec<DeviceId>,
    pub attestations: Vec<Attestation>,
    pub priority: Priority,
}

/// Source of encoded device traffic.
///
/// Implementations spawn background tasks that push batches into the
/// returned channel until the cancellation token fires.
#[async_trait]
pub trait EdgeSource: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<EdgeBatch>, Self::Error>;

    /// Force the next frame of each device to be a full frame.
    fn request_full(&self, devices: &[DeviceId]);
}

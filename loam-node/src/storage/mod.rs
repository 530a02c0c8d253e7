mod memory;
mod sqlite;

pub use memory::MemoryRowStorage;
pub use sqlite::{SqliteRowStorage, SqliteStorageError};

use async_trait::async_trait;
pub use loam_core::RowKey;
use loam_core::{DeviceId, FieldId, StorageRow};

/// Sink for decoded telemetry rows.
///
/// A row is identified by its [`RowKey`]; storing the same key twice replaces
/// the earlier row, so redelivered batches do not duplicate data.
#[async_trait]
pub trait RowStorage: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn store_batch(&self, rows: Vec<StorageRow>) -> Result<(), Self::Error>;
    async fn count(&self) -> Result<usize, Self::Error>;
    async fn rows_for_device(&self, device_id: DeviceId) -> Result<Vec<StorageRow>, Self::Error>;
    async fn rows_for_field(&self, field_id: FieldId) -> Result<Vec<StorageRow>, Self::Error>;

    /// Up to `limit` rows in key order, strictly after `after`.
    async fn rows_after(
        &self,
        after: Option<RowKey>,
        limit: usize,
    ) -> Result<Vec<StorageRow>, Self::Error>;

    /// Order-independent checksum over every stored row.
    ///
    /// Two stores holding the same rows report the same value, which is what a
    /// node advertises as its heartbeat `state_checksum`.
    fn checksum(&self) -> u64;
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

struct Fnv(u64);

impl Fnv {
    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }
}

/// Stable content hash of one row. Ingest time is excluded so that nodes
/// storing the same readings at different moments agree.
pub fn row_hash(row: &StorageRow) -> u64 {
    let mut h = Fnv(FNV_OFFSET);
    h.write(&row.sensor_id.device_id.0.to_be_bytes());
    h.write(&[row.sensor_id.channel as u8]);
    h.write(&row.timestamp.0.to_be_bytes());
    h.write(&[row.depth_index.unwrap_or(0xff)]);
    h.write(&row.field_id.0.to_be_bytes());
    h.write(row.tenant_id.0.as_bytes());
    h.write(&row.value.to_bits().to_be_bytes());
    if let Some(hash) = &row.content_hash {
        h.write(hash.as_bytes());
    }
    h.0
}

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use loam_core::{DeviceId, FieldId, StorageRow};

use super::{RowKey, RowStorage, row_hash};

#[derive(Clone, Default)]
pub struct MemoryRowStorage {
    rows: Arc<DashMap<RowKey, StorageRow>>,
    checksum: Arc<AtomicU64>,
}

impl MemoryRowStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&StorageRow) -> bool) -> Vec<StorageRow> {
        let mut rows: Vec<StorageRow> = self
            .rows
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by_key(|row| (row.timestamp, RowKey::of(row)));
        rows
    }
}

#[async_trait]
impl RowStorage for MemoryRowStorage {
    type Error = Infallible;

    async fn store_batch(&self, rows: Vec<StorageRow>) -> Result<(), Self::Error> {
        for row in rows {
            let hash = row_hash(&row);
            let replaced = self.rows.insert(RowKey::of(&row), row);
            if let Some(old) = replaced {
                self.checksum.fetch_sub(row_hash(&old), Ordering::Relaxed);
            }
            self.checksum.fetch_add(hash, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize, Self::Error> {
        Ok(self.rows.len())
    }

    async fn rows_for_device(&self, device_id: DeviceId) -> Result<Vec<StorageRow>, Self::Error> {
        Ok(self.collect(|row| row.sensor_id.device_id == device_id))
    }

    async fn rows_for_field(&self, field_id: FieldId) -> Result<Vec<StorageRow>, Self::Error> {
        Ok(self.collect(|row| row.field_id == field_id))
    }

    async fn rows_after(
        &self,
        after: Option<RowKey>,
        limit: usize,
    ) -> Result<Vec<StorageRow>, Self::Error> {
        let mut rows: Vec<(RowKey, StorageRow)> = self
            .rows
            .iter()
            .filter(|entry| after.is_none_or(|after| *entry.key() > after))
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_unstable_by_key(|(key, _)| *key);
        rows.truncate(limit);
        Ok(rows.into_iter().map(|(_, row)| row).collect())
    }

    fn checksum(&self) -> u64 {
        self.checksum.load(Ordering::Relaxed)
    }
}

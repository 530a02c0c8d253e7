use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use loam_core::{ChannelKind, DeviceId, DeviceTimestamp, FieldId, SensorId, StorageRow, TenantId};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use tokio::sync::Mutex;

use super::{RowKey, RowStorage, row_hash};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SELECT_ROWS: &str = r#"
    SELECT device_id, channel, timestamp, depth_index, field_id, tenant_id,
           measurement, value, content_hash, signature, ingested_at
    FROM rows
"#;

#[derive(Debug, thiserror::Error)]
pub enum SqliteStorageError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("invalid channel kind: {0}")]
    InvalidChannel(i64),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}

#[derive(Clone)]
pub struct SqliteRowStorage {
    pool: SqlitePool,
    checksum: Arc<AtomicU64>,
    // Serializes writers so the running checksum sees every replacement.
    writer: Arc<Mutex<()>>,
}

impl SqliteRowStorage {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, SqliteStorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    pub async fn new_in_memory() -> Result<Self, SqliteStorageError> {
        // Every connection to `:memory:` opens its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, SqliteStorageError> {
        MIGRATOR.run(&pool).await?;

        let hashes: Vec<i64> = sqlx::query_scalar("SELECT row_hash FROM rows")
            .fetch_all(&pool)
            .await?;
        let checksum = hashes
            .into_iter()
            .fold(0u64, |acc, h| acc.wrapping_add(h as u64));

        Ok(Self {
            pool,
            checksum: Arc::new(AtomicU64::new(checksum)),
            writer: Arc::new(Mutex::new(())),
        })
    }

    async fn fetch(&self, column: &str, value: i64) -> Result<Vec<StorageRow>, SqliteStorageError> {
        let sql = format!(
            "{SELECT_ROWS} WHERE {column} = ? ORDER BY timestamp, device_id, channel, depth_index"
        );
        let rows = sqlx::query(&sql).bind(value).fetch_all(&self.pool).await?;

        rows.iter().map(map_row).collect()
    }
}

#[async_trait]
impl RowStorage for SqliteRowStorage {
    type Error = SqliteStorageError;

    async fn store_batch(&self, rows: Vec<StorageRow>) -> Result<(), Self::Error> {
        let _writer = self.writer.lock().await;
        let mut tx = self.pool.begin().await?;
        let mut added = 0u64;
        let mut removed = 0u64;

        for row in rows {
            let hash = row_hash(&row);
            let depth = row.depth_index.map_or(-1, i64::from);

            let previous: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT row_hash FROM rows
                WHERE device_id = ? AND channel = ? AND timestamp = ? AND depth_index = ?
                "#,
            )
            .bind(row.sensor_id.device_id.0 as i64)
            .bind(row.sensor_id.channel as u8 as i64)
            .bind(row.timestamp.0 as i64)
            .bind(depth)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO rows (device_id, channel, timestamp, depth_index, field_id, tenant_id, measurement, value, unit, content_hash, signature, ingested_at, row_hash)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.sensor_id.device_id.0 as i64)
            .bind(row.sensor_id.channel as u8 as i64)
            .bind(row.timestamp.0 as i64)
            .bind(depth)
            .bind(row.field_id.0 as i64)
            .bind(&*row.tenant_id.0)
            .bind(&*row.measurement)
            .bind(row.value)
            .bind(row.unit.symbol())
            .bind(row.content_hash.as_deref())
            .bind(row.signature.as_deref())
            .bind(row.ingested_at.as_millisecond())
            .bind(hash as i64)
            .execute(&mut *tx)
            .await?;

            if let Some(previous) = previous {
                removed = removed.wrapping_add(previous as u64);
            }
            added = added.wrapping_add(hash);
        }

        tx.commit().await?;
        self.checksum.fetch_add(added, Ordering::Relaxed);
        self.checksum.fetch_sub(removed, Ordering::Relaxed);
        Ok(())
    }

    async fn count(&self) -> Result<usize, Self::Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn rows_for_device(&self, device_id: DeviceId) -> Result<Vec<StorageRow>, Self::Error> {
        self.fetch("device_id", device_id.0 as i64).await
    }

    async fn rows_for_field(&self, field_id: FieldId) -> Result<Vec<StorageRow>, Self::Error> {
        self.fetch("field_id", field_id.0 as i64).await
    }

    async fn rows_after(
        &self,
        after: Option<RowKey>,
        limit: usize,
    ) -> Result<Vec<StorageRow>, Self::Error> {
        const ORDER: &str = "ORDER BY device_id, channel, timestamp, depth_index LIMIT ?";
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = match after {
            None => {
                sqlx::query(&format!("{SELECT_ROWS} {ORDER}"))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            Some(key) => {
                let sql = format!(
                    "{SELECT_ROWS} WHERE (device_id, channel, timestamp, depth_index) > (?, ?, ?, ?) {ORDER}"
                );
                sqlx::query(&sql)
                    .bind(key.device_id.0 as i64)
                    .bind(key.channel as u8 as i64)
                    .bind(key.timestamp.0 as i64)
                    .bind(key.depth_index.map_or(-1, i64::from))
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(map_row).collect()
    }

    fn checksum(&self) -> u64 {
        self.checksum.load(Ordering::Relaxed)
    }
}

fn map_row(row: &SqliteRow) -> Result<StorageRow, SqliteStorageError> {
    let channel: i64 = row.try_get("channel")?;
    let channel = u8::try_from(channel)
        .ok()
        .and_then(|c| ChannelKind::try_from(c).ok())
        .ok_or(SqliteStorageError::InvalidChannel(channel))?;

    let depth: i64 = row.try_get("depth_index")?;
    let ingested_at: i64 = row.try_get("ingested_at")?;
    let ingested_at = jiff::Timestamp::from_millisecond(ingested_at)
        .map_err(|_| SqliteStorageError::InvalidTimestamp(ingested_at))?;

    let tenant: String = row.try_get("tenant_id")?;
    let measurement: String = row.try_get("measurement")?;
    let content_hash: Option<String> = row.try_get("content_hash")?;
    let signature: Option<String> = row.try_get("signature")?;

    Ok(StorageRow {
        timestamp: DeviceTimestamp(row.try_get::<i64, _>("timestamp")? as u64),
        sensor_id: SensorId {
            device_id: DeviceId(row.try_get::<i64, _>("device_id")? as u32),
            channel,
        },
        field_id: FieldId(row.try_get::<i64, _>("field_id")? as u32),
        tenant_id: TenantId(tenant.into_boxed_str()),
        measurement: measurement.into_boxed_str(),
        value: row.try_get("value")?,
        unit: channel.unit(),
        depth_index: u8::try_from(depth).ok(),
        content_hash: content_hash.map(String::into_boxed_str),
        signature: signature.map(String::into_boxed_str),
        ingested_at,
    })
}

#[cfg(test)]
mod tests {
    use loam_core::{Attestation, ChannelValue, Reading};

    use super::*;
    use crate::storage::fixtures::rows;
    use crate::storage::{MemoryRowStorage, RowStorage};

    #[tokio::test]
    async fn stored_rows_read_back_intact() {
        let storage = SqliteRowStorage::new_in_memory().await.unwrap();
        let reading = Reading::new(
            DeviceId(9),
            FieldId(3),
            DeviceTimestamp(60_000),
            vec![ChannelValue::new(ChannelKind::Ph, 6.4).unwrap()],
            Some(2),
        )
        .unwrap();
        let attestation = Attestation {
            device_id: DeviceId(9),
            timestamp: DeviceTimestamp(60_000),
            content_hash: "abc123".into(),
            signature: "sig".into(),
        };
        let written = StorageRow::from_reading(
            &reading,
            &TenantId("farm".into()),
            Some(&attestation),
            jiff::Timestamp::from_millisecond(1_700_000_000_000).unwrap(),
        );
        storage.store_batch(written.clone()).await.unwrap();

        let read = storage.rows_for_device(DeviceId(9)).await.unwrap();
        assert_eq!(read, written);
        assert_eq!(&*read[0].measurement, "soil_ph");
        assert_eq!(read[0].depth_index, Some(2));
    }

    #[tokio::test]
    async fn checksum_matches_memory_storage() {
        let sqlite = SqliteRowStorage::new_in_memory().await.unwrap();
        let memory = MemoryRowStorage::new();

        let batches = [
            rows(1, 4, 1_000, 30.0),
            rows(2, 4, 1_000, 31.0),
            rows(1, 4, 1_000, 29.5),
        ];
        for batch in batches {
            sqlite.store_batch(batch.clone()).await.unwrap();
            memory.store_batch(batch).await.unwrap();
        }

        assert_eq!(sqlite.count().await.unwrap(), 4);
        assert_eq!(sqlite.checksum(), memory.checksum());
        assert_eq!(sqlite.rows_for_field(FieldId(4)).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn pages_match_memory_storage() {
        let sqlite = SqliteRowStorage::new_in_memory().await.unwrap();
        let memory = MemoryRowStorage::new();
        for batch in [rows(3, 1, 1_000, 20.0), rows(1, 1, 5_000, 21.0), rows(1, 1, 1_000, 22.0)] {
            sqlite.store_batch(batch.clone()).await.unwrap();
            memory.store_batch(batch).await.unwrap();
        }

        let mut after = None;
        let mut pages = 0;
        loop {
            let from_sqlite = sqlite.rows_after(after, 4).await.unwrap();
            let from_memory = memory.rows_after(after, 4).await.unwrap();
            let keys: Vec<_> = from_sqlite.iter().map(RowKey::of).collect();
            assert_eq!(keys, from_memory.iter().map(RowKey::of).collect::<Vec<_>>());
            let Some(last) = keys.last() else {
                break;
            };
            after = Some(*last);
            pages += 1;
        }
        assert_eq!(pages, 2);
    }

    #[tokio::test]
    async fn checksum_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");

        let checksum = {
            let storage = SqliteRowStorage::new(&path).await.unwrap();
            storage.store_batch(rows(5, 1, 1_000, 22.0)).await.unwrap();
            storage.store_batch(rows(5, 1, 2_000, 23.0)).await.unwrap();
            storage.checksum()
        };
        assert_ne!(checksum, 0);

        let reopened = SqliteRowStorage::new(&path).await.unwrap();
        assert_eq!(reopened.checksum(), checksum);
        assert_eq!(reopened.count().await.unwrap(), 4);
    }
}

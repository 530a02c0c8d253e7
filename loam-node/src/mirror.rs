//! Mirror catch-up. A mirror asked to sync pages through the primary's rows
//! over RPC and stores them; row keys make the copy idempotent.

use std::net::SocketAddr;

use loam_core::{RowKey, RowPage, RowPageRequest};
use loam_rpc::{Client, ClientError};

use crate::config::MirrorConfig;
use crate::storage::RowStorage;

/// Largest page a node serves, whatever the caller asks for.
pub const MAX_PAGE: u32 = 2_000;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("primary unreachable: {0}")]
    Primary(#[from] ClientError),
    #[error("failed to store mirrored rows: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Answer a page request from a mirror.
pub async fn row_page<R: RowStorage>(
    storage: &R,
    request: RowPageRequest,
) -> Result<RowPage, R::Error> {
    let limit = request.limit.clamp(1, MAX_PAGE) as usize;
    let rows = storage.rows_after(request.after, limit).await?;
    let next = if rows.len() == limit {
        rows.last().map(RowKey::of)
    } else {
        None
    };

    Ok(RowPage {
        rows: rows.into_boxed_slice(),
        next,
    })
}

/// Copy every row the primary at `primary` holds into `storage`. Returns the
/// number of rows received.
pub async fn pull_rows<R: RowStorage>(
    storage: &R,
    primary: SocketAddr,
    config: &MirrorConfig,
) -> Result<u64, MirrorError> {
    let client = Client::connect(primary, config.timeout()).await?;
    let mut after = None;
    let mut copied = 0u64;

    loop {
        let page = client
            .fetch_rows(RowPageRequest {
                after,
                limit: config.page_size,
            })
            .await?;

        copied += page.rows.len() as u64;
        if !page.rows.is_empty() {
            storage
                .store_batch(page.rows.into_vec())
                .await
                .map_err(|e| MirrorError::Storage(Box::new(e)))?;
        }

        match page.next {
            Some(next) => after = Some(next),
            None => break,
        }
    }

    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRowStorage;
    use crate::storage::fixtures::rows;

    #[tokio::test]
    async fn full_page_points_at_the_next_one() {
        let storage = MemoryRowStorage::new();
        for device in 1..=3 {
            storage.store_batch(rows(device, 1, 1_000, 30.0)).await.unwrap();
        }

        let page = row_page(&storage, RowPageRequest { after: None, limit: 4 })
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 4);
        assert_eq!(page.next, Some(RowKey::of(&page.rows[3])));

        let last = row_page(&storage, RowPageRequest { after: page.next, limit: 4 })
            .await
            .unwrap();
        assert_eq!(last.rows.len(), 2);
        assert_eq!(last.next, None);
    }

    #[tokio::test]
    async fn limit_is_clamped() {
        let storage = MemoryRowStorage::new();
        storage.store_batch(rows(1, 1, 1_000, 30.0)).await.unwrap();

        let page = row_page(&storage, RowPageRequest { after: None, limit: 0 })
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 1);
        assert!(page.next.is_some());
    }
}

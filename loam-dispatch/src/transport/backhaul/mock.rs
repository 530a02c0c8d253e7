use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loam_core::fec;
use loam_core::{AckStatus, MessageId, ShardUpload, UploadAck};
use rand::Rng;

use super::{Backhaul, LinkError};

/// Behaviour of a simulated link.
#[derive(Debug, Clone, PartialEq)]
pub enum MockLinkMode {
    Healthy,
    /// Every send fails at the link level.
    Down,
    /// These shard indices never reach the receiver.
    DropShards(HashSet<u16>),
    /// Each shard is lost independently with this probability.
    Lossy(f64),
}

/// In-process link with a receiver that reconstructs the payload.
#[derive(Debug)]
pub struct MockBackhaul {
    mode: Mutex<MockLinkMode>,
    latency: Duration,
    attempts: AtomicU64,
    delivered: Mutex<Vec<(MessageId, Vec<u8>)>>,
}

impl MockBackhaul {
    pub fn new(mode: MockLinkMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            latency: Duration::ZERO,
            attempts: AtomicU64::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn healthy() -> Self {
        Self::new(MockLinkMode::Healthy)
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_mode(&self, mode: MockLinkMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }

    /// Number of `send` calls seen, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Payloads the simulated receiver reconstructed, in arrival order.
    pub fn delivered(&self) -> Vec<(MessageId, Vec<u8>)> {
        self.delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn mode(&self) -> MockLinkMode {
        self.mode
            .lock()
            .map(|m| m.clone())
            .unwrap_or(MockLinkMode::Down)
    }
}

#[async_trait]
impl Backhaul for MockBackhaul {
    async fn send(&self, upload: ShardUpload) -> Result<UploadAck, LinkError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let survivors: Vec<_> = match self.mode() {
            MockLinkMode::Healthy => upload.shards.to_vec(),
            MockLinkMode::Down => return Err(LinkError::Down("simulated outage".into())),
            MockLinkMode::DropShards(lost) => upload
                .shards
                .iter()
                .filter(|s| !lost.contains(&s.index))
                .cloned()
                .collect(),
            MockLinkMode::Lossy(rate) => {
                let mut rng = rand::rng();
                upload
                    .shards
                    .iter()
                    .filter(|_| !rng.random_bool(rate.clamp(0.0, 1.0)))
                    .cloned()
                    .collect()
            }
        };

        let status = match fec::reconstruct(&upload.layout, &survivors) {
            Ok(payload) => {
                if let Ok(mut delivered) = self.delivered.lock() {
                    delivered.push((upload.message_id, payload));
                }
                AckStatus::Delivered {
                    resync: Box::new([]),
                }
            }
            Err(e) => AckStatus::Unrecoverable {
                reason: e.to_string().into(),
            },
        };

        Ok(UploadAck {
            message_id: upload.message_id,
            status,
        })
    }
}

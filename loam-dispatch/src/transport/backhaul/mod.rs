pub mod mock;
pub mod tcp;

use async_trait::async_trait;
use loam_core::{ShardUpload, UploadAck};
use thiserror::Error;

pub use mock::{MockBackhaul, MockLinkMode};
pub use tcp::TcpBackhaul;

/// Link-level failure. Feeds the endpoint's circuit breaker and is never
/// surfaced per message.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("link timed out")]
    Timeout,
    #[error("link down: {0}")]
    Down(String),
    #[error("remote rejected request: {0}")]
    Rejected(String),
}

/// One backhaul path to the processing tier.
#[async_trait]
pub trait Backhaul: Send + Sync + 'static {
    /// Send the shards of one message and wait for the receiver's verdict.
    async fn send(&self, upload: ShardUpload) -> Result<UploadAck, LinkError>;
}

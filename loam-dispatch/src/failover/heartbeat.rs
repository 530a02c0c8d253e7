use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use loam_core::{GatewayId, HeartbeatRequest, NodeHeartbeat, NodeId};
use loam_rpc::{Client, ClientError};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::HeartbeatRecord;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("node unreachable")]
    Unreachable,
}

/// Where liveness signals for one node come from.
#[async_trait]
pub trait HeartbeatSource: Send + Sync + 'static {
    async fn beat(&self) -> Result<NodeHeartbeat, HeartbeatError>;
}

/// Asks a node for its heartbeat over a dedicated RPC connection, separate
/// from the backhaul links so that transport congestion cannot delay it.
pub struct RpcHeartbeatSource {
    addr: SocketAddr,
    gateway_id: GatewayId,
    timeout: Duration,
    client: Mutex<Option<Client>>,
}

impl RpcHeartbeatSource {
    pub fn new(addr: SocketAddr, gateway_id: GatewayId, timeout: Duration) -> Self {
        Self {
            addr,
            gateway_id,
            timeout,
            client: Mutex::new(None),
        }
    }
}

#[async_trait]
impl HeartbeatSource for RpcHeartbeatSource {
    async fn beat(&self) -> Result<NodeHeartbeat, HeartbeatError> {
        let mut guard = self.client.lock().await;

        if guard.as_ref().is_none_or(Client::is_closed) {
            *guard = Some(Client::connect(self.addr, self.timeout).await?);
        }
        let Some(client) = guard.as_ref() else {
            return Err(HeartbeatError::Unreachable);
        };

        let request = HeartbeatRequest {
            gateway_id: self.gateway_id,
        };
        match client.heartbeat(request).await {
            Ok(heartbeat) => Ok(heartbeat),
            Err(e) => {
                guard.take();
                Err(e.into())
            }
        }
    }
}

/// In-process node whose liveness and checksum are set by the caller.
#[derive(Debug)]
pub struct MockHeartbeatSource {
    node_id: NodeId,
    alive: AtomicBool,
    checksum: AtomicU64,
}

impl MockHeartbeatSource {
    pub fn new(node_id: NodeId, alive: bool) -> Self {
        Self {
            node_id,
            alive: AtomicBool::new(alive),
            checksum: AtomicU64::new(0),
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn set_checksum(&self, checksum: u64) {
        self.checksum.store(checksum, Ordering::Relaxed);
    }
}

#[async_trait]
impl HeartbeatSource for MockHeartbeatSource {
    async fn beat(&self) -> Result<NodeHeartbeat, HeartbeatError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(HeartbeatError::Unreachable);
        }
        Ok(NodeHeartbeat {
            node_id: self.node_id,
            state_checksum: self.checksum.load(Ordering::Relaxed),
            sent_at: jiff::Timestamp::now(),
        })
    }
}

/// Polls one node on a fixed period and forwards every heartbeat to the
/// orchestrator's heartbeat channel.
pub struct HeartbeatPoller {
    node_id: NodeId,
    source: Arc<dyn HeartbeatSource>,
    interval: Duration,
    tx: mpsc::Sender<HeartbeatRecord>,
}

impl HeartbeatPoller {
    pub fn new(
        node_id: NodeId,
        source: Arc<dyn HeartbeatSource>,
        interval: Duration,
        tx: mpsc::Sender<HeartbeatRecord>,
    ) -> Self {
        Self {
            node_id,
            source,
            interval,
            tx,
        }
    }

    #[tracing::instrument(skip_all, fields(node_id = self.node_id.0))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let beat = tokio::select! {
                _ = cancel.cancelled() => break,
                beat = self.source.beat() => beat,
            };

            match beat {
                Ok(heartbeat) => {
                    if heartbeat.node_id != self.node_id {
                        warn!(reported = heartbeat.node_id.0, "heartbeat from unexpected node id");
                        continue;
                    }
                    let record = HeartbeatRecord {
                        node_id: self.node_id,
                        received_at: Instant::now(),
                        sent_at: heartbeat.sent_at,
                        state_checksum: heartbeat.state_checksum,
                    };
                    if self.tx.send(record).await.is_err() {
                        break;
                    }
                }
                Err(e) => debug!("no heartbeat: {e}"),
            }
        }
    }
}

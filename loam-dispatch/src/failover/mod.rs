//! Failover orchestration for the processing tier: primary, mirror and cold
//! spare, supervised over a heartbeat channel of their own.

pub mod cutover;
pub mod heartbeat;
mod supervisor;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use loam_core::{
    Alert, EndpointId, MirrorSyncRequest, NodeId, NodeRole, Priority, UploadPayload,
};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::AlertSink;
use crate::gate::WriteGate;
use crate::transport::Transport;
use cutover::Cutover;

pub use supervisor::{
    Action, FailoverState, FailoverStatus, NodeStatus, Promotion, StateLabel, Supervisor,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Expected heartbeat period; a primary silent for longer is suspect.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a suspect primary is failed over.
    pub suspect_timeout_ms: u64,
    pub promotion_timeout_secs: u64,
    pub cold_spare_timeout_secs: u64,
    /// Period of the liveness check.
    pub tick_ms: u64,
    /// Period at which each node is polled for a heartbeat.
    pub poll_interval_ms: u64,
    /// Minimum gap between sync requests to a lagging mirror.
    pub mirror_sync_interval_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            suspect_timeout_ms: 15_000,
            promotion_timeout_secs: 30,
            cold_spare_timeout_secs: 30 * 60,
            tick_ms: 500,
            poll_interval_ms: 1_000,
            mirror_sync_interval_ms: 10_000,
        }
    }
}

impl FailoverConfig {
    pub fn validate(&self) -> Result<(), FailoverError> {
        if self.heartbeat_interval_ms == 0 || self.tick_ms == 0 || self.poll_interval_ms == 0 {
            return Err(FailoverError::InvalidConfig("intervals must be non-zero"));
        }
        if self.suspect_timeout_ms <= self.heartbeat_interval_ms {
            return Err(FailoverError::InvalidConfig(
                "suspect_timeout_ms must exceed heartbeat_interval_ms",
            ));
        }
        if self.promotion_timeout_secs == 0 || self.cold_spare_timeout_secs == 0 {
            return Err(FailoverError::InvalidConfig("timeouts must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FailoverError {
    #[error("invalid failover config: {0}")]
    InvalidConfig(&'static str),
    #[error("exactly one primary is required, found {0}")]
    PrimaryCount(usize),
    #[error("node {0:?} listed twice")]
    DuplicateNode(NodeId),
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("not failed over")]
    NotFailedOver,
    #[error("promotion still in progress")]
    PromotionPending,
    #[error("no stalled promotion to retry")]
    NotStalled,
    #[error("node {node:?} has role {role:?} and cannot be recovered")]
    InvalidRecoveryTarget { node: NodeId, role: NodeRole },
    #[error("orchestrator is not running")]
    Stopped,
}

/// Liveness signal as received by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub node_id: NodeId,
    pub received_at: Instant,
    /// Wall-clock send time reported by the node.
    pub sent_at: jiff::Timestamp,
    pub state_checksum: u64,
}

/// A supervised node and its initial role.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub id: NodeId,
    pub role: NodeRole,
    /// Transport endpoint dedicated to this node. Telemetry follows the
    /// primary's; mirror sync requests use the mirror's.
    pub endpoint: Option<EndpointId>,
    /// RPC address a mirror pulls rows from while this node is primary.
    pub rpc_addr: Option<SocketAddr>,
}

impl NodeSpec {
    pub fn new(id: NodeId, role: NodeRole) -> Self {
        Self {
            id,
            role,
            endpoint: None,
            rpc_addr: None,
        }
    }
}

enum Command {
    SignalRecovered {
        node: NodeId,
        reply: oneshot::Sender<Result<(), FailoverError>>,
    },
    RetryPromotion {
        reply: oneshot::Sender<Result<(), FailoverError>>,
    },
    PromotionDone {
        target: NodeId,
        result: Result<(), String>,
    },
}

/// Cheap handle for operators and the HTTP API.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    heartbeats: mpsc::Sender<HeartbeatRecord>,
    status: watch::Receiver<FailoverStatus>,
}

impl OrchestratorHandle {
    pub fn status(&self) -> FailoverStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FailoverStatus> {
        self.status.clone()
    }

    /// Sender for heartbeat pollers.
    pub fn heartbeats(&self) -> mpsc::Sender<HeartbeatRecord> {
        self.heartbeats.clone()
    }

    pub async fn signal_recovered(&self, node: NodeId) -> Result<(), FailoverError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SignalRecovered { node, reply })
            .await
            .map_err(|_| FailoverError::Stopped)?;
        rx.await.map_err(|_| FailoverError::Stopped)?
    }

    pub async fn retry_promotion(&self) -> Result<(), FailoverError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::RetryPromotion { reply })
            .await
            .map_err(|_| FailoverError::Stopped)?;
        rx.await.map_err(|_| FailoverError::Stopped)?
    }
}

/// Drives a [`Supervisor`] from a fixed-period tick and the heartbeat
/// channel, and carries out its actions.
pub struct Orchestrator {
    supervisor: Supervisor,
    config: FailoverConfig,
    gate: WriteGate,
    alerts: Arc<dyn AlertSink>,
    cutover: Arc<dyn Cutover>,
    transport: Option<Transport>,
    heartbeats: mpsc::Receiver<HeartbeatRecord>,
    commands: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    status: watch::Sender<FailoverStatus>,
}

impl Orchestrator {
    pub fn new(
        config: FailoverConfig,
        nodes: &[NodeSpec],
        gate: WriteGate,
        alerts: Arc<dyn AlertSink>,
        cutover: Arc<dyn Cutover>,
    ) -> Result<(Self, OrchestratorHandle), FailoverError> {
        let now = Instant::now();
        let supervisor = Supervisor::new(config.clone(), nodes, now)?;

        let (hb_tx, hb_rx) = mpsc::channel(256);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (status_tx, status_rx) = watch::channel(supervisor.status(now));

        let handle = OrchestratorHandle {
            commands: cmd_tx.clone(),
            heartbeats: hb_tx,
            status: status_rx,
        };

        let orchestrator = Self {
            supervisor,
            config,
            gate,
            alerts,
            cutover,
            transport: None,
            heartbeats: hb_rx,
            commands: cmd_rx,
            command_tx: cmd_tx,
            status: status_tx,
        };

        Ok((orchestrator, handle))
    }

    /// Transport that follows the primary and carries mirror sync requests.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        for (endpoint, node) in self.supervisor.endpoints() {
            transport.bind_endpoint(endpoint, node);
        }
        transport.route_to(self.supervisor.primary());
        self.transport = Some(transport);
        self
    }

    #[tracing::instrument(name = "orchestrator", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Alerts go out in order on their own task; a slow sink never delays a tick.
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        let alert_task = tokio::spawn(forward_alerts(self.alerts.clone(), alert_rx));

        info!(primary = ?self.supervisor.primary(), "failover orchestrator started");

        loop {
            let actions = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.supervisor.tick(Instant::now()),
                Some(record) = self.heartbeats.recv() => self.supervisor.heartbeat(record),
                Some(command) = self.commands.recv() => self.command(command),
            };

            for action in actions {
                self.execute(action, &alert_tx);
            }
            if let Some(transport) = &self.transport {
                transport.route_to(self.supervisor.primary());
            }
            self.status.send_replace(self.supervisor.status(Instant::now()));
        }

        drop(alert_tx);
        let _ = alert_task.await;
        info!("failover orchestrator stopped");
    }

    fn command(&mut self, command: Command) -> Vec<Action> {
        let now = Instant::now();
        match command {
            Command::SignalRecovered { node, reply } => {
                let (result, actions) = split(self.supervisor.signal_recovered(node, now));
                let _ = reply.send(result);
                actions
            }
            Command::RetryPromotion { reply } => {
                let (result, actions) = split(self.supervisor.retry_promotion(now));
                let _ = reply.send(result);
                actions
            }
            Command::PromotionDone { target, result } => {
                self.supervisor.promotion_done(target, result, now)
            }
        }
    }

    fn execute(&self, action: Action, alerts: &mpsc::UnboundedSender<Alert>) {
        match action {
            Action::Alert(alert) => {
                let _ = alerts.send(alert);
            }
            Action::CloseGate => self.gate.close(),
            Action::OpenGate => self.gate.open(),
            Action::Reroute { from, to } => {
                let cutover = self.cutover.clone();
                let done = self.command_tx.clone();
                let timeout = Duration::from_secs(self.config.promotion_timeout_secs);
                tokio::spawn(async move {
                    info!(from = from.0, to = to.0, "promoting node");
                    let result = match tokio::time::timeout(timeout, cutover.reroute(from, to)).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("cutover timed out".to_owned()),
                    };
                    let _ = done.send(Command::PromotionDone { target: to, result }).await;
                });
            }
            Action::PowerOn(node) => {
                let cutover = self.cutover.clone();
                tokio::spawn(async move {
                    if let Err(e) = cutover.power_on(node).await {
                        error!(node_id = node.0, "power-on failed: {e}");
                    }
                });
            }
            Action::SyncMirror {
                mirror,
                endpoint,
                primary,
                primary_addr,
                checksum,
            } => self.request_mirror_sync(mirror, endpoint, primary, primary_addr, checksum),
        }
    }

    fn request_mirror_sync(
        &self,
        mirror: NodeId,
        endpoint: Option<EndpointId>,
        primary: NodeId,
        primary_addr: Option<SocketAddr>,
        checksum: u64,
    ) {
        let Some(transport) = &self.transport else {
            debug!(mirror = mirror.0, "mirror lags primary, no transport to sync over");
            return;
        };
        // Untargeted traffic goes to the primary, never to the mirror.
        let Some(endpoint) = endpoint else {
            debug!(mirror = mirror.0, "mirror lags primary, no endpoint reaches it");
            return;
        };

        let request = UploadPayload::MirrorSync(MirrorSyncRequest {
            primary,
            primary_checksum: checksum,
            primary_addr,
            requested_at: jiff::Timestamp::now(),
        });
        let payload = match postcard::to_allocvec(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode mirror sync request: {e}");
                return;
            }
        };

        match transport.enqueue_to(payload, Priority::Control, endpoint) {
            Ok(ticket) => {
                debug!(mirror = mirror.0, message_id = %ticket.id(), "mirror sync requested");
                tokio::spawn(async move {
                    if let Err(e) = ticket.outcome().await {
                        warn!(mirror = mirror.0, "mirror sync request failed: {e}");
                    }
                });
            }
            Err(e) => warn!(mirror = mirror.0, "could not enqueue mirror sync: {e}"),
        }
    }
}

fn split(result: Result<Vec<Action>, FailoverError>) -> (Result<(), FailoverError>, Vec<Action>) {
    match result {
        Ok(actions) => (Ok(()), actions),
        Err(e) => (Err(e), Vec::new()),
    }
}

async fn forward_alerts(sink: Arc<dyn AlertSink>, mut rx: mpsc::UnboundedReceiver<Alert>) {
    while let Some(alert) = rx.recv().await {
        let id = alert.id;
        if let Err(e) = sink.raise(alert).await {
            error!(alert_id = %id.0, "failed to deliver alert: {e}");
        }
    }
}

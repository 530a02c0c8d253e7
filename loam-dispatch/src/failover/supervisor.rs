use std::net::SocketAddr;
use std::time::Duration;

use loam_core::{Alert, AlertKind, AlertSeverity, EndpointId, NodeId, NodeRole};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{FailoverConfig, FailoverError, HeartbeatRecord, NodeSpec};

/// Side effect requested by the supervisor. The orchestrator carries them out.
#[derive(Debug, Clone)]
pub enum Action {
    Alert(Alert),
    CloseGate,
    OpenGate,
    /// Move traffic from the failed primary to `to`; completion is reported
    /// back through [`Supervisor::promotion_done`].
    Reroute { from: NodeId, to: NodeId },
    PowerOn(NodeId),
    SyncMirror {
        mirror: NodeId,
        endpoint: Option<EndpointId>,
        primary: NodeId,
        /// Where the mirror pulls the primary's rows from.
        primary_addr: Option<SocketAddr>,
        checksum: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// Cutover to `target` is running.
    InProgress { target: NodeId, started: Instant },
    /// No healthy mirror; waiting for the powered-on spare to heartbeat.
    AwaitingColdSpare { spare: NodeId, since: Instant },
    /// Promotion could not finish in time; needs `retry_promotion`.
    Stalled { target: Option<NodeId> },
    Complete { primary: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Healthy,
    Suspect {
        since: Instant,
    },
    FailedOver {
        at: Instant,
        failed: NodeId,
        promotion: Promotion,
    },
    Recovering {
        node: NodeId,
        since: Instant,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateLabel {
    Healthy,
    Suspect,
    FailedOver,
    Recovering,
}

impl FailoverState {
    pub fn label(&self) -> StateLabel {
        match self {
            FailoverState::Healthy => StateLabel::Healthy,
            FailoverState::Suspect { .. } => StateLabel::Suspect,
            FailoverState::FailedOver { .. } => StateLabel::FailedOver,
            FailoverState::Recovering { .. } => StateLabel::Recovering,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: u16,
    pub role: NodeRole,
    pub last_heartbeat_ms_ago: Option<u64>,
    pub state_checksum: Option<u64>,
}

/// Snapshot published after every orchestrator step.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverStatus {
    pub state: StateLabel,
    pub primary: Option<u16>,
    /// Set while a promotion has not completed.
    pub promotion_pending: bool,
    pub nodes: Vec<NodeStatus>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    id: NodeId,
    role: NodeRole,
    endpoint: Option<EndpointId>,
    rpc_addr: Option<SocketAddr>,
    last_heartbeat: Option<Instant>,
    checksum: Option<u64>,
    last_sync_request: Option<Instant>,
}

/// Failover state machine over a fixed set of nodes. Pure: every input
/// carries its own instant and every effect is returned as an [`Action`].
#[derive(Debug)]
pub struct Supervisor {
    config: FailoverConfig,
    state: FailoverState,
    nodes: Vec<NodeEntry>,
    started_at: Instant,
    /// Spare powered on to become the next mirror.
    spare_activation: Option<(NodeId, Instant)>,
    /// The acting primary went silent while failed over.
    cascade_alerted: bool,
}

impl Supervisor {
    pub fn new(
        config: FailoverConfig,
        nodes: &[NodeSpec],
        now: Instant,
    ) -> Result<Self, FailoverError> {
        config.validate()?;

        let primaries = nodes.iter().filter(|n| n.role == NodeRole::Primary).count();
        if primaries != 1 {
            return Err(FailoverError::PrimaryCount(primaries));
        }
        for (i, node) in nodes.iter().enumerate() {
            if nodes[..i].iter().any(|n| n.id == node.id) {
                return Err(FailoverError::DuplicateNode(node.id));
            }
        }

        let nodes = nodes
            .iter()
            .map(|spec| NodeEntry {
                id: spec.id,
                role: spec.role,
                endpoint: spec.endpoint,
                rpc_addr: spec.rpc_addr,
                last_heartbeat: None,
                checksum: None,
                last_sync_request: None,
            })
            .collect();

        Ok(Self {
            config,
            state: FailoverState::Healthy,
            nodes,
            started_at: now,
            spare_activation: None,
            cascade_alerted: false,
        })
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn role(&self, node: NodeId) -> Option<NodeRole> {
        self.node(node).map(|n| n.role)
    }

    pub fn primary(&self) -> Option<NodeId> {
        self.with_role(NodeRole::Primary)
    }

    /// Endpoints dedicated to one node.
    pub fn endpoints(&self) -> impl Iterator<Item = (EndpointId, NodeId)> + '_ {
        self.nodes
            .iter()
            .filter_map(|n| n.endpoint.map(|endpoint| (endpoint, n.id)))
    }

    pub fn status(&self, now: Instant) -> FailoverStatus {
        let promotion_pending = matches!(
            self.state,
            FailoverState::FailedOver { promotion, .. }
                if !matches!(promotion, Promotion::Complete { .. })
        );

        FailoverStatus {
            state: self.state.label(),
            primary: self.primary().map(|n| n.0),
            promotion_pending,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeStatus {
                    id: n.id.0,
                    role: n.role,
                    last_heartbeat_ms_ago: n
                        .last_heartbeat
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                    state_checksum: n.checksum,
                })
                .collect(),
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    fn suspect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.suspect_timeout_ms)
    }

    fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.iter().find(|n| n.id == id)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    fn with_role(&self, role: NodeRole) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.role == role).map(|n| n.id)
    }

    fn set_role(&mut self, id: NodeId, role: NodeRole) {
        if let Some(node) = self.node_mut(id) {
            info!(node_id = id.0, from = ?node.role, to = ?role, "node role changed");
            node.role = role;
        }
    }

    /// Last sign of life, counting supervisor start as one.
    fn last_seen(&self, id: NodeId) -> Instant {
        self.node(id)
            .and_then(|n| n.last_heartbeat)
            .unwrap_or(self.started_at)
    }

    fn is_live(&self, id: NodeId, now: Instant) -> bool {
        self.node(id)
            .and_then(|n| n.last_heartbeat)
            .is_some_and(|at| now.saturating_duration_since(at) < self.suspect_timeout())
    }

    pub fn heartbeat(&mut self, record: HeartbeatRecord) -> Vec<Action> {
        let mut actions = Vec::new();
        let now = record.received_at;

        // A primary heartbeat arriving after the suspect timeout is late: the
        // failover it missed happens first, whether or not a tick ran.
        if matches!(self.state, FailoverState::Suspect { .. })
            && self.primary() == Some(record.node_id)
            && now.saturating_duration_since(self.last_seen(record.node_id))
                >= self.suspect_timeout()
        {
            actions = self.tick(now);
        }

        let Some(node) = self.node_mut(record.node_id) else {
            warn!(node_id = record.node_id.0, "heartbeat from unknown node");
            return actions;
        };
        node.last_heartbeat = Some(now);
        node.checksum = Some(record.state_checksum);
        let role = node.role;

        if self
            .spare_activation
            .is_some_and(|(spare, _)| spare == record.node_id)
        {
            self.spare_activation = None;
            if role == NodeRole::ColdSpare {
                self.set_role(record.node_id, NodeRole::Mirror);
            }
        }

        match self.state {
            FailoverState::Suspect { .. } if role == NodeRole::Primary => {
                self.state = FailoverState::Healthy;
                actions.push(alert(
                    AlertSeverity::Info,
                    AlertKind::HeartbeatRestored,
                    record.node_id,
                    "primary heartbeat restored before suspect timeout",
                ));
            }
            FailoverState::FailedOver {
                at,
                failed,
                promotion: Promotion::AwaitingColdSpare { spare, .. },
            } if spare == record.node_id => {
                self.state = FailoverState::FailedOver {
                    at,
                    failed,
                    promotion: Promotion::InProgress {
                        target: spare,
                        started: now,
                    },
                };
                actions.push(Action::Reroute {
                    from: failed,
                    to: spare,
                });
            }
            FailoverState::Recovering { node, since }
                if node == record.node_id && now >= since =>
            {
                let primary_checksum = self
                    .primary()
                    .and_then(|p| self.node(p))
                    .and_then(|p| p.checksum);

                if primary_checksum == Some(record.state_checksum) {
                    if let Some(mirror) = self.with_role(NodeRole::Mirror) {
                        self.set_role(mirror, NodeRole::ColdSpare);
                    }
                    self.set_role(node, NodeRole::Mirror);
                    self.state = FailoverState::Healthy;
                    self.cascade_alerted = false;
                    actions.push(alert(
                        AlertSeverity::Info,
                        AlertKind::RecoveryCompleted,
                        node,
                        "restored node matches primary state, now mirror",
                    ));
                }
            }
            _ => {}
        }

        if role == NodeRole::Degraded
            && matches!(self.state, FailoverState::FailedOver { .. })
        {
            actions.push(alert(
                AlertSeverity::Info,
                AlertKind::UnexpectedHeartbeat,
                record.node_id,
                "degraded node is heartbeating; awaiting explicit recovery signal",
            ));
        }

        actions
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let cold_spare_timeout = Duration::from_secs(self.config.cold_spare_timeout_secs);
        let promotion_timeout = Duration::from_secs(self.config.promotion_timeout_secs);

        if let Some((spare, since)) = self.spare_activation
            && now.saturating_duration_since(since) >= cold_spare_timeout
        {
            self.spare_activation = None;
            actions.push(alert(
                AlertSeverity::Critical,
                AlertKind::ColdSpareTimeout,
                spare,
                "cold spare did not come online in time",
            ));
        }

        match self.state {
            FailoverState::Healthy => {
                let Some(primary) = self.primary() else {
                    return actions;
                };
                let silent = now.saturating_duration_since(self.last_seen(primary));
                if silent > self.heartbeat_interval() {
                    self.state = FailoverState::Suspect { since: now };
                    actions.push(alert(
                        AlertSeverity::Warning,
                        AlertKind::HeartbeatMissed,
                        primary,
                        format!("no primary heartbeat for {} ms", silent.as_millis()),
                    ));
                } else {
                    self.sync_mirror(primary, now, &mut actions);
                }
            }
            FailoverState::Suspect { .. } => {
                if let Some(primary) = self.primary()
                    && now.saturating_duration_since(self.last_seen(primary))
                        >= self.suspect_timeout()
                {
                    self.fail_over(primary, now, &mut actions);
                }
            }
            FailoverState::FailedOver {
                at,
                failed,
                promotion,
            } => match promotion {
                Promotion::InProgress { target, started }
                    if now.saturating_duration_since(started) >= promotion_timeout =>
                {
                    self.state = FailoverState::FailedOver {
                        at,
                        failed,
                        promotion: Promotion::Stalled {
                            target: Some(target),
                        },
                    };
                    actions.push(alert(
                        AlertSeverity::Fatal,
                        AlertKind::PromotionTimeout,
                        target,
                        format!(
                            "promotion did not complete within {} s; writes stay blocked",
                            promotion_timeout.as_secs()
                        ),
                    ));
                }
                Promotion::AwaitingColdSpare { spare, since }
                    if now.saturating_duration_since(since) >= cold_spare_timeout =>
                {
                    self.state = FailoverState::FailedOver {
                        at,
                        failed,
                        promotion: Promotion::Stalled {
                            target: Some(spare),
                        },
                    };
                    actions.push(alert(
                        AlertSeverity::Fatal,
                        AlertKind::ColdSpareTimeout,
                        spare,
                        "cold spare never came online; no primary available",
                    ));
                }
                Promotion::Complete { primary } => self.watch_acting_primary(primary, now, &mut actions),
                _ => {}
            },
            FailoverState::Recovering { .. } => {
                if let Some(primary) = self.primary() {
                    self.watch_acting_primary(primary, now, &mut actions);
                    self.sync_mirror(primary, now, &mut actions);
                }
            }
        }

        actions
    }

    /// Demote the silent primary and start promoting a replacement.
    fn fail_over(&mut self, failed: NodeId, now: Instant, actions: &mut Vec<Action>) {
        self.set_role(failed, NodeRole::Degraded);
        actions.push(Action::CloseGate);
        actions.push(alert(
            AlertSeverity::Critical,
            AlertKind::FailoverTriggered,
            failed,
            format!(
                "primary silent for {} ms, failing over",
                now.saturating_duration_since(self.last_seen(failed)).as_millis()
            ),
        ));

        let promotion = self.begin_promotion(failed, now, actions);
        self.state = FailoverState::FailedOver {
            at: now,
            failed,
            promotion,
        };
    }

    fn begin_promotion(
        &mut self,
        failed: NodeId,
        now: Instant,
        actions: &mut Vec<Action>,
    ) -> Promotion {
        let mirror = self
            .nodes
            .iter()
            .find(|n| n.role == NodeRole::Mirror && self.is_live(n.id, now))
            .map(|n| n.id);
        let spare = self.with_role(NodeRole::ColdSpare);

        if let Some(mirror) = mirror {
            actions.push(Action::Reroute {
                from: failed,
                to: mirror,
            });
            if let Some(spare) = spare
                && self.spare_activation.is_none()
            {
                self.spare_activation = Some((spare, now));
                actions.push(Action::PowerOn(spare));
                actions.push(alert(
                    AlertSeverity::Info,
                    AlertKind::ColdSpareRequested,
                    spare,
                    "powering on cold spare as next mirror",
                ));
            }
            return Promotion::InProgress {
                target: mirror,
                started: now,
            };
        }

        match spare {
            Some(spare) => {
                if self.is_live(spare, now) {
                    actions.push(Action::Reroute {
                        from: failed,
                        to: spare,
                    });
                    return Promotion::InProgress {
                        target: spare,
                        started: now,
                    };
                }
                actions.push(Action::PowerOn(spare));
                actions.push(alert(
                    AlertSeverity::Critical,
                    AlertKind::ColdSpareRequested,
                    spare,
                    "no healthy mirror; promoting cold spare once it is online",
                ));
                Promotion::AwaitingColdSpare { spare, since: now }
            }
            None => {
                actions.push(alert(
                    AlertSeverity::Fatal,
                    AlertKind::PromotionTimeout,
                    failed,
                    "no healthy mirror and no cold spare to promote",
                ));
                Promotion::Stalled { target: None }
            }
        }
    }

    fn watch_acting_primary(&mut self, primary: NodeId, now: Instant, actions: &mut Vec<Action>) {
        let silent = now.saturating_duration_since(self.last_seen(primary));
        if silent >= self.suspect_timeout() && !self.cascade_alerted {
            self.cascade_alerted = true;
            actions.push(alert(
                AlertSeverity::Critical,
                AlertKind::HeartbeatMissed,
                primary,
                "acting primary silent while failed over; manual intervention required",
            ));
        }
    }

    /// Ask every lagging mirror, and a node under recovery, to pull from the primary.
    fn sync_mirror(&mut self, primary: NodeId, now: Instant, actions: &mut Vec<Action>) {
        let sync_interval = Duration::from_millis(self.config.mirror_sync_interval_ms);
        let recovering = match self.state {
            FailoverState::Recovering { node, .. } => Some(node),
            _ => None,
        };
        let Some((checksum, primary_addr)) = self
            .node(primary)
            .and_then(|p| p.checksum.map(|c| (c, p.rpc_addr)))
        else {
            return;
        };

        for mirror in self
            .nodes
            .iter_mut()
            .filter(|n| n.role == NodeRole::Mirror || Some(n.id) == recovering)
        {
            let lagging = mirror.checksum.is_some_and(|c| c != checksum);
            let due = mirror
                .last_sync_request
                .is_none_or(|at| now.saturating_duration_since(at) >= sync_interval);
            if lagging && due {
                mirror.last_sync_request = Some(now);
                actions.push(Action::SyncMirror {
                    mirror: mirror.id,
                    endpoint: mirror.endpoint,
                    primary,
                    primary_addr,
                    checksum,
                });
            }
        }
    }

    /// Cutover finished for `target`, successfully or not.
    pub fn promotion_done(
        &mut self,
        target: NodeId,
        result: Result<(), String>,
        now: Instant,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let FailoverState::FailedOver {
            at,
            failed,
            promotion,
        } = self.state
        else {
            return actions;
        };

        let pending = match promotion {
            Promotion::InProgress { target: t, .. } => t == target,
            // A cutover that finished after its deadline still moved traffic.
            Promotion::Stalled { target: Some(t) } => t == target,
            _ => false,
        };
        if !pending {
            return actions;
        }

        match result {
            Ok(()) => {
                self.set_role(target, NodeRole::Primary);
                self.state = FailoverState::FailedOver {
                    at,
                    failed,
                    promotion: Promotion::Complete { primary: target },
                };
                actions.push(Action::OpenGate);
                actions.push(alert(
                    AlertSeverity::Info,
                    AlertKind::PromotionCompleted,
                    target,
                    format!(
                        "promoted to primary {} ms after failover",
                        now.saturating_duration_since(at).as_millis()
                    ),
                ));
            }
            Err(reason) => {
                self.state = FailoverState::FailedOver {
                    at,
                    failed,
                    promotion: Promotion::Stalled {
                        target: Some(target),
                    },
                };
                actions.push(alert(
                    AlertSeverity::Fatal,
                    AlertKind::PromotionTimeout,
                    target,
                    format!("cutover failed: {reason}"),
                ));
            }
        }

        actions
    }

    /// Restart a stalled promotion.
    pub fn retry_promotion(&mut self, now: Instant) -> Result<Vec<Action>, FailoverError> {
        let FailoverState::FailedOver {
            at,
            failed,
            promotion: Promotion::Stalled { .. },
        } = self.state
        else {
            return Err(FailoverError::NotStalled);
        };

        let mut actions = Vec::new();
        let promotion = self.begin_promotion(failed, now, &mut actions);
        self.state = FailoverState::FailedOver {
            at,
            failed,
            promotion,
        };
        Ok(actions)
    }

    /// Operator signal that `node` is back online and restored from the primary.
    pub fn signal_recovered(
        &mut self,
        node: NodeId,
        now: Instant,
    ) -> Result<Vec<Action>, FailoverError> {
        let FailoverState::FailedOver { promotion, .. } = self.state else {
            return Err(FailoverError::NotFailedOver);
        };
        if !matches!(promotion, Promotion::Complete { .. }) {
            return Err(FailoverError::PromotionPending);
        }

        let role = self.role(node).ok_or(FailoverError::UnknownNode(node))?;
        if !matches!(role, NodeRole::Degraded | NodeRole::ColdSpare) {
            return Err(FailoverError::InvalidRecoveryTarget { node, role });
        }

        self.state = FailoverState::Recovering { node, since: now };
        Ok(vec![alert(
            AlertSeverity::Info,
            AlertKind::RecoveryStarted,
            node,
            "recovery signalled; waiting for matching state checksum",
        )])
    }
}

fn alert(
    severity: AlertSeverity,
    kind: AlertKind,
    node: NodeId,
    message: impl Into<Box<str>>,
) -> Action {
    Action::Alert(Alert::new(severity, kind, Some(node), message))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY: NodeId = NodeId(1);
    const MIRROR: NodeId = NodeId(2);
    const SPARE: NodeId = NodeId(3);

    fn config() -> FailoverConfig {
        FailoverConfig {
            heartbeat_interval_ms: 1_000,
            suspect_timeout_ms: 3_000,
            promotion_timeout_secs: 30,
            cold_spare_timeout_secs: 60,
            ..FailoverConfig::default()
        }
    }

    fn nodes() -> Vec<NodeSpec> {
        vec![
            NodeSpec::new(PRIMARY, NodeRole::Primary),
            NodeSpec::new(MIRROR, NodeRole::Mirror),
            NodeSpec::new(SPARE, NodeRole::ColdSpare),
        ]
    }

    fn beat(node: NodeId, at: Instant, checksum: u64) -> HeartbeatRecord {
        HeartbeatRecord {
            node_id: node,
            received_at: at,
            sent_at: jiff::Timestamp::now(),
            state_checksum: checksum,
        }
    }

    fn kinds(actions: &[Action]) -> Vec<AlertKind> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Alert(alert) => Some(alert.kind),
                _ => None,
            })
            .collect()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    /// Primary and mirror heartbeat at t0, then the primary goes silent.
    fn failed_over() -> (Supervisor, Instant) {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(config(), &nodes(), t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 7));
        sup.heartbeat(beat(MIRROR, t0, 7));
        sup.tick(t0 + secs(2));
        sup.heartbeat(beat(MIRROR, t0 + secs(2), 7));
        let actions = sup.tick(t0 + secs(3));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Reroute { from: PRIMARY, to: MIRROR }
        )));
        (sup, t0)
    }

    #[test]
    fn rejects_two_primaries() {
        let nodes = vec![
            NodeSpec::new(PRIMARY, NodeRole::Primary),
            NodeSpec::new(MIRROR, NodeRole::Primary),
        ];
        assert!(matches!(
            Supervisor::new(config(), &nodes, Instant::now()),
            Err(FailoverError::PrimaryCount(2))
        ));
    }

    #[test]
    fn heartbeat_before_timeout_returns_to_healthy() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(config(), &nodes(), t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 1));

        let actions = sup.tick(t0 + Duration::from_millis(1_500));
        assert_eq!(kinds(&actions), vec![AlertKind::HeartbeatMissed]);
        assert_eq!(sup.state().label(), StateLabel::Suspect);

        let actions = sup.heartbeat(beat(PRIMARY, t0 + Duration::from_millis(2_900), 1));
        assert_eq!(kinds(&actions), vec![AlertKind::HeartbeatRestored]);
        assert_eq!(sup.state(), FailoverState::Healthy);

        assert!(sup.tick(t0 + Duration::from_millis(3_100)).is_empty());
        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Primary));
    }

    #[test]
    fn late_heartbeat_does_not_cancel_failover() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(config(), &nodes(), t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 7));
        sup.heartbeat(beat(MIRROR, t0, 7));
        sup.tick(t0 + Duration::from_millis(1_500));
        assert_eq!(sup.state().label(), StateLabel::Suspect);
        sup.heartbeat(beat(MIRROR, t0 + Duration::from_millis(2_000), 7));

        // no tick between the suspect timeout and this heartbeat
        let actions = sup.heartbeat(beat(PRIMARY, t0 + Duration::from_millis(3_400), 7));
        assert!(matches!(actions[0], Action::CloseGate));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Reroute { from: PRIMARY, to: MIRROR }
        )));
        let kinds = kinds(&actions);
        assert!(kinds.contains(&AlertKind::FailoverTriggered));
        assert!(!kinds.contains(&AlertKind::HeartbeatRestored));
        assert_eq!(sup.state().label(), StateLabel::FailedOver);
        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Degraded));
    }

    #[test]
    fn silent_primary_fails_over_within_suspect_timeout() {
        let (sup, _) = failed_over();

        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Degraded));
        // no primary until the cutover confirms
        assert_eq!(sup.primary(), None);
        assert!(matches!(
            sup.state(),
            FailoverState::FailedOver {
                failed: PRIMARY,
                promotion: Promotion::InProgress { target: MIRROR, .. },
                ..
            }
        ));
    }

    #[test]
    fn failover_closes_gate_and_wakes_spare() {
        let t0 = Instant::now();
        let mut sup = Supervisor::new(config(), &nodes(), t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 7));
        sup.tick(t0 + secs(2));
        sup.heartbeat(beat(MIRROR, t0 + secs(2), 7));

        let actions = sup.tick(t0 + secs(3));
        assert!(matches!(actions[0], Action::CloseGate));
        assert!(actions.iter().any(|a| matches!(a, Action::PowerOn(SPARE))));
        assert_eq!(
            kinds(&actions),
            vec![AlertKind::FailoverTriggered, AlertKind::ColdSpareRequested]
        );
    }

    #[test]
    fn promotion_completes_and_opens_gate() {
        let (mut sup, t0) = failed_over();

        let actions = sup.promotion_done(MIRROR, Ok(()), t0 + secs(4));
        assert!(matches!(actions[0], Action::OpenGate));
        assert_eq!(kinds(&actions), vec![AlertKind::PromotionCompleted]);
        assert_eq!(sup.primary(), Some(MIRROR));
    }

    #[test]
    fn promotion_timeout_is_fatal_and_retryable() {
        let (mut sup, t0) = failed_over();
        sup.heartbeat(beat(MIRROR, t0 + secs(20), 7));

        let actions = sup.tick(t0 + secs(33));
        let Action::Alert(alert) = &actions[0] else {
            panic!("expected alert, got {actions:?}");
        };
        assert_eq!(alert.kind, AlertKind::PromotionTimeout);
        assert_eq!(alert.severity, AlertSeverity::Fatal);
        assert!(!actions.iter().any(|a| matches!(a, Action::OpenGate)));

        sup.heartbeat(beat(MIRROR, t0 + secs(34), 7));
        let actions = sup.retry_promotion(t0 + secs(35)).unwrap();
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Reroute { from: PRIMARY, to: MIRROR }
        )));
        assert!(matches!(
            sup.retry_promotion(t0 + secs(35)),
            Err(FailoverError::NotStalled)
        ));
    }

    #[test]
    fn no_mirror_promotes_spare_once_online() {
        let t0 = Instant::now();
        let nodes = vec![
            NodeSpec::new(PRIMARY, NodeRole::Primary),
            NodeSpec::new(SPARE, NodeRole::ColdSpare),
        ];
        let mut sup = Supervisor::new(config(), &nodes, t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 7));
        sup.tick(t0 + secs(2));

        let actions = sup.tick(t0 + secs(3));
        assert!(actions.iter().any(|a| matches!(a, Action::PowerOn(SPARE))));
        let requested = actions
            .iter()
            .find_map(|a| match a {
                Action::Alert(alert) if alert.kind == AlertKind::ColdSpareRequested => Some(alert),
                _ => None,
            })
            .unwrap();
        assert_eq!(requested.severity, AlertSeverity::Critical);

        let actions = sup.heartbeat(beat(SPARE, t0 + secs(40), 0));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Reroute { from: PRIMARY, to: SPARE }
        )));
        sup.promotion_done(SPARE, Ok(()), t0 + secs(41));
        assert_eq!(sup.primary(), Some(SPARE));
    }

    #[test]
    fn spare_that_never_boots_times_out() {
        let t0 = Instant::now();
        let nodes = vec![
            NodeSpec::new(PRIMARY, NodeRole::Primary),
            NodeSpec::new(SPARE, NodeRole::ColdSpare),
        ];
        let mut sup = Supervisor::new(config(), &nodes, t0).unwrap();
        sup.tick(t0 + secs(2));
        sup.tick(t0 + secs(3));

        let actions = sup.tick(t0 + secs(64));
        assert_eq!(kinds(&actions), vec![AlertKind::ColdSpareTimeout]);
        assert!(matches!(
            sup.state(),
            FailoverState::FailedOver {
                promotion: Promotion::Stalled { target: Some(SPARE) },
                ..
            }
        ));
    }

    #[test]
    fn degraded_heartbeat_does_not_resolve_failover() {
        let (mut sup, t0) = failed_over();
        sup.promotion_done(MIRROR, Ok(()), t0 + secs(4));

        let actions = sup.heartbeat(beat(PRIMARY, t0 + secs(5), 7));
        assert_eq!(kinds(&actions), vec![AlertKind::UnexpectedHeartbeat]);
        assert_eq!(sup.state().label(), StateLabel::FailedOver);
        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Degraded));
    }

    #[test]
    fn recovery_needs_signal_and_matching_checksum() {
        let (mut sup, t0) = failed_over();
        assert!(matches!(
            sup.signal_recovered(PRIMARY, t0 + secs(3)),
            Err(FailoverError::PromotionPending)
        ));
        sup.promotion_done(MIRROR, Ok(()), t0 + secs(4));
        sup.heartbeat(beat(MIRROR, t0 + secs(5), 42));

        assert!(matches!(
            sup.signal_recovered(MIRROR, t0 + secs(6)),
            Err(FailoverError::InvalidRecoveryTarget { .. })
        ));
        let actions = sup.signal_recovered(PRIMARY, t0 + secs(6)).unwrap();
        assert_eq!(kinds(&actions), vec![AlertKind::RecoveryStarted]);

        // stale state: stays recovering
        assert!(sup.heartbeat(beat(PRIMARY, t0 + secs(7), 41)).is_empty());
        assert_eq!(sup.state().label(), StateLabel::Recovering);

        let actions = sup.heartbeat(beat(PRIMARY, t0 + secs(8), 42));
        assert_eq!(kinds(&actions), vec![AlertKind::RecoveryCompleted]);
        assert_eq!(sup.state(), FailoverState::Healthy);
        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Mirror));
        assert_eq!(sup.role(MIRROR), Some(NodeRole::Primary));
    }

    #[test]
    fn recovering_node_is_told_to_catch_up() {
        let (mut sup, t0) = failed_over();
        sup.promotion_done(MIRROR, Ok(()), t0 + secs(4));
        sup.heartbeat(beat(MIRROR, t0 + secs(5), 42));
        sup.signal_recovered(PRIMARY, t0 + secs(6)).unwrap();
        sup.heartbeat(beat(PRIMARY, t0 + secs(6), 7));

        let actions = sup.tick(t0 + secs(6) + Duration::from_millis(500));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::SyncMirror {
                mirror: PRIMARY,
                primary: MIRROR,
                checksum: 42,
                ..
            }
        )));
        assert_eq!(sup.state().label(), StateLabel::Recovering);
    }

    #[test]
    fn spare_becomes_mirror_then_steps_back_on_recovery() {
        let (mut sup, t0) = failed_over();
        sup.promotion_done(MIRROR, Ok(()), t0 + secs(4));
        sup.heartbeat(beat(SPARE, t0 + secs(10), 0));
        assert_eq!(sup.role(SPARE), Some(NodeRole::Mirror));

        sup.heartbeat(beat(MIRROR, t0 + secs(11), 9));
        sup.signal_recovered(PRIMARY, t0 + secs(12)).unwrap();
        sup.heartbeat(beat(PRIMARY, t0 + secs(13), 9));

        assert_eq!(sup.role(PRIMARY), Some(NodeRole::Mirror));
        assert_eq!(sup.role(SPARE), Some(NodeRole::ColdSpare));
        let primaries = sup
            .status(t0 + secs(13))
            .nodes
            .iter()
            .filter(|n| n.role == NodeRole::Primary)
            .count();
        assert_eq!(primaries, 1);
    }

    #[test]
    fn lagging_mirror_gets_sync_requests() {
        let t0 = Instant::now();
        let mut nodes = nodes();
        nodes[0].rpc_addr = Some(SocketAddr::from(([10, 0, 0, 1], 9000)));
        nodes[1].endpoint = Some(EndpointId(4));
        let mut sup = Supervisor::new(config(), &nodes, t0).unwrap();
        sup.heartbeat(beat(PRIMARY, t0, 100));
        sup.heartbeat(beat(MIRROR, t0, 90));

        let actions = sup.tick(t0 + Duration::from_millis(500));
        assert!(matches!(
            actions[..],
            [Action::SyncMirror {
                mirror: MIRROR,
                endpoint: Some(EndpointId(4)),
                primary: PRIMARY,
                primary_addr: Some(addr),
                checksum: 100,
            }] if addr.port() == 9000
        ));

        // rate limited
        sup.heartbeat(beat(PRIMARY, t0 + Duration::from_millis(600), 100));
        assert!(sup.tick(t0 + Duration::from_millis(700)).is_empty());

        sup.heartbeat(beat(MIRROR, t0 + Duration::from_millis(800), 100));
        sup.heartbeat(beat(PRIMARY, t0 + Duration::from_millis(800), 100));
        assert!(sup.tick(t0 + secs(20)).iter().all(|a| !matches!(a, Action::SyncMirror { .. })));
    }
}

use std::sync::Arc;
use std::time::Duration;

use loam_core::{AlertKind, AlertSeverity, EndpointId, NodeId, NodeRole, Priority, UploadPayload};
use loam_dispatch::failover::StateLabel;
use loam_dispatch::failover::cutover::CutoverCall;
use loam_dispatch::{
    Backhaul, FailoverConfig, FailoverError, FailoverStatus, HeartbeatPoller, MemoryAlertSink,
    MockBackhaul, MockCutover, MockHeartbeatSource, NodeSpec, Orchestrator, OrchestratorHandle,
    Transport, TransportConfig, WriteGate,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PRIMARY: NodeId = NodeId(1);
const MIRROR: NodeId = NodeId(2);
const SPARE: NodeId = NodeId(3);

struct Cluster {
    gate: WriteGate,
    handle: OrchestratorHandle,
    alerts: Arc<MemoryAlertSink>,
    cutover: Arc<MockCutover>,
    primary: Arc<MockHeartbeatSource>,
    mirror: Arc<MockHeartbeatSource>,
    cancel: CancellationToken,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn config() -> FailoverConfig {
    FailoverConfig {
        heartbeat_interval_ms: 1_000,
        suspect_timeout_ms: 3_000,
        promotion_timeout_secs: 5,
        cold_spare_timeout_secs: 600,
        tick_ms: 100,
        poll_interval_ms: 250,
        mirror_sync_interval_ms: 10_000,
    }
}

/// Primary and mirror heartbeating, cold spare powered down.
fn start(cutover: MockCutover, transport: Option<Transport>) -> Cluster {
    let gate = transport
        .as_ref()
        .map(|t| t.gate().clone())
        .unwrap_or_default();
    let alerts = Arc::new(MemoryAlertSink::new());
    let cutover = Arc::new(cutover);
    let cancel = CancellationToken::new();

    let nodes = [
        NodeSpec {
            endpoint: Some(EndpointId(1)),
            ..NodeSpec::new(PRIMARY, NodeRole::Primary)
        },
        NodeSpec {
            endpoint: Some(EndpointId(2)),
            ..NodeSpec::new(MIRROR, NodeRole::Mirror)
        },
        NodeSpec::new(SPARE, NodeRole::ColdSpare),
    ];
    let (orchestrator, handle) = Orchestrator::new(
        config(),
        &nodes,
        gate.clone(),
        alerts.clone(),
        cutover.clone(),
    )
    .unwrap();
    let orchestrator = match transport {
        Some(transport) => orchestrator.with_transport(transport),
        None => orchestrator,
    };
    tokio::spawn(orchestrator.run(cancel.clone()));

    let primary = Arc::new(MockHeartbeatSource::new(PRIMARY, true));
    let mirror = Arc::new(MockHeartbeatSource::new(MIRROR, true));
    let spare = Arc::new(MockHeartbeatSource::new(SPARE, false));
    for (id, source) in [(PRIMARY, &primary), (MIRROR, &mirror), (SPARE, &spare)] {
        let poller = HeartbeatPoller::new(
            id,
            source.clone(),
            Duration::from_millis(config().poll_interval_ms),
            handle.heartbeats(),
        );
        tokio::spawn(poller.run(cancel.clone()));
    }

    Cluster {
        gate,
        handle,
        alerts,
        cutover,
        primary,
        mirror,
        cancel,
    }
}

async fn wait_status(
    handle: &OrchestratorHandle,
    f: impl FnMut(&FailoverStatus) -> bool,
) -> FailoverStatus {
    let mut rx = handle.subscribe();
    let status = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(f))
        .await
        .expect("status never reached")
        .expect("orchestrator stopped");
    status.clone()
}

async fn wait_gate(gate: &WriteGate, open: bool) {
    let mut rx = gate.subscribe();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|o| *o == open))
        .await
        .expect("gate never changed")
        .expect("gate dropped");
}

fn role(status: &FailoverStatus, node: NodeId) -> NodeRole {
    status
        .nodes
        .iter()
        .find(|n| n.id == node.0)
        .map(|n| n.role)
        .expect("node in status")
}

#[tokio::test(start_paused = true)]
async fn silent_primary_is_replaced_by_mirror() {
    let cluster = start(MockCutover::new().with_delay(Duration::from_millis(500)), None);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = cluster.handle.status();
    assert_eq!(status.state, StateLabel::Healthy);
    assert_eq!(status.primary, Some(PRIMARY.0));
    assert!(cluster.gate.is_open());

    cluster.primary.set_alive(false);
    let silenced = Instant::now();
    wait_gate(&cluster.gate, false).await;
    let detected = silenced.elapsed();

    // suspect timeout counted from the last beat, plus one poll and one tick
    assert!(detected >= Duration::from_millis(2_500), "{detected:?}");
    assert!(detected <= Duration::from_millis(3_400), "{detected:?}");

    let status = cluster.handle.status();
    assert_eq!(status.state, StateLabel::FailedOver);
    assert!(status.promotion_pending);
    assert_eq!(status.primary, None);
    assert_eq!(role(&status, PRIMARY), NodeRole::Degraded);

    wait_gate(&cluster.gate, true).await;
    let status = cluster.handle.status();
    assert_eq!(status.primary, Some(MIRROR.0));
    assert!(!status.promotion_pending);

    let calls = cluster.cutover.calls();
    assert!(calls.contains(&CutoverCall::Reroute {
        from: PRIMARY,
        to: MIRROR
    }));
    assert!(calls.contains(&CutoverCall::PowerOn(SPARE)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        cluster.alerts.kinds(),
        vec![
            AlertKind::HeartbeatMissed,
            AlertKind::FailoverTriggered,
            AlertKind::ColdSpareRequested,
            AlertKind::PromotionCompleted,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn brief_heartbeat_gap_does_not_fail_over() {
    let cluster = start(MockCutover::new(), None);
    tokio::time::sleep(Duration::from_secs(1)).await;

    cluster.primary.set_alive(false);
    wait_status(&cluster.handle, |s| s.state == StateLabel::Suspect).await;
    cluster.primary.set_alive(true);
    wait_status(&cluster.handle, |s| s.state == StateLabel::Healthy).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(cluster.gate.is_open());
    assert!(cluster.cutover.calls().is_empty());
    assert!(cluster.alerts.find(AlertKind::FailoverTriggered).is_none());
    assert!(cluster.alerts.find(AlertKind::HeartbeatRestored).is_some());
}

#[tokio::test(start_paused = true)]
async fn slow_cutover_stalls_promotion_with_fatal_alert() {
    let cluster = start(MockCutover::new().with_delay(Duration::from_secs(60)), None);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(matches!(
        cluster.handle.retry_promotion().await,
        Err(FailoverError::NotStalled)
    ));

    cluster.primary.set_alive(false);
    wait_gate(&cluster.gate, false).await;
    let failed_at = Instant::now();

    let status = wait_status(&cluster.handle, |_| true).await;
    assert!(status.promotion_pending);

    // wait for the alert forwarder to catch up with the timeout
    while cluster.alerts.find(AlertKind::PromotionTimeout).is_none() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let alert = cluster.alerts.find(AlertKind::PromotionTimeout).unwrap();
    assert_eq!(alert.severity, AlertSeverity::Fatal);
    assert!(failed_at.elapsed() >= Duration::from_secs(5));
    assert!(!cluster.gate.is_open());

    cluster.handle.retry_promotion().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reroutes = cluster
        .cutover
        .calls()
        .into_iter()
        .filter(|c| matches!(c, CutoverCall::Reroute { .. }))
        .count();
    assert_eq!(reroutes, 2);
    assert!(!cluster.gate.is_open());
}

#[tokio::test(start_paused = true)]
async fn recovered_node_rejoins_as_mirror_once_in_sync() {
    let cluster = start(MockCutover::new(), None);
    cluster.primary.set_checksum(3);
    cluster.mirror.set_checksum(9);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(matches!(
        cluster.handle.signal_recovered(PRIMARY).await,
        Err(FailoverError::NotFailedOver)
    ));

    cluster.primary.set_alive(false);
    wait_gate(&cluster.gate, false).await;
    wait_gate(&cluster.gate, true).await;

    assert!(matches!(
        cluster.handle.signal_recovered(MIRROR).await,
        Err(FailoverError::InvalidRecoveryTarget {
            role: NodeRole::Primary,
            ..
        })
    ));
    assert!(matches!(
        cluster.handle.signal_recovered(NodeId(42)).await,
        Err(FailoverError::UnknownNode(_))
    ));

    // back online but still holding stale state
    cluster.primary.set_alive(true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    cluster.handle.signal_recovered(PRIMARY).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let status = cluster.handle.status();
    assert_eq!(status.state, StateLabel::Recovering);
    assert_eq!(role(&status, PRIMARY), NodeRole::Degraded);

    cluster.primary.set_checksum(9);
    let status = wait_status(&cluster.handle, |s| s.state == StateLabel::Healthy).await;
    assert_eq!(status.primary, Some(MIRROR.0));
    assert_eq!(role(&status, PRIMARY), NodeRole::Mirror);
    assert_eq!(role(&status, SPARE), NodeRole::ColdSpare);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let kinds = cluster.alerts.kinds();
    assert!(kinds.contains(&AlertKind::UnexpectedHeartbeat));
    assert!(kinds.ends_with(&[AlertKind::RecoveryStarted, AlertKind::RecoveryCompleted]));
}

/// Transport with one endpoint dedicated to the primary and one to the mirror.
fn node_links() -> (Transport, Arc<MockBackhaul>, Arc<MockBackhaul>) {
    let primary_link = Arc::new(MockBackhaul::healthy());
    let mirror_link = Arc::new(MockBackhaul::healthy());
    let transport = Transport::new(
        TransportConfig::default(),
        vec![
            (
                EndpointId(1),
                "primary".into(),
                primary_link.clone() as Arc<dyn Backhaul>,
            ),
            (
                EndpointId(2),
                "mirror".into(),
                mirror_link.clone() as Arc<dyn Backhaul>,
            ),
        ],
        WriteGate::default(),
    )
    .unwrap();
    (transport, primary_link, mirror_link)
}

fn payloads(link: &MockBackhaul) -> Vec<Vec<u8>> {
    link.delivered().into_iter().map(|(_, p)| p).collect()
}

#[tokio::test(start_paused = true)]
async fn telemetry_follows_the_acting_primary() {
    let (transport, primary_link, mirror_link) = node_links();
    let transport_cancel = CancellationToken::new();
    let _tasks = transport.start(transport_cancel.clone());
    let cluster = start(MockCutover::new(), Some(transport.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    for batch in [b"t1", b"t2", b"t3"] {
        let delivery = transport
            .send_with_failover(batch.to_vec(), Priority::Telemetry)
            .await
            .unwrap();
        assert_eq!(delivery.endpoint, EndpointId(1));
    }
    assert_eq!(payloads(&primary_link), vec![b"t1".to_vec(), b"t2".to_vec(), b"t3".to_vec()]);
    assert!(mirror_link.delivered().is_empty());

    cluster.primary.set_alive(false);
    wait_status(&cluster.handle, |s| s.primary == Some(MIRROR.0)).await;
    wait_gate(&cluster.gate, true).await;

    let delivery = transport
        .send_with_failover(b"t4".to_vec(), Priority::Telemetry)
        .await
        .unwrap();
    assert_eq!(delivery.endpoint, EndpointId(2));
    assert_eq!(payloads(&mirror_link), vec![b"t4".to_vec()]);
    assert_eq!(primary_link.delivered().len(), 3);

    transport_cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn lagging_mirror_is_sent_a_sync_request() {
    let (transport, primary_link, mirror_link) = node_links();
    let transport_cancel = CancellationToken::new();
    let _tasks = transport.start(transport_cancel.clone());

    let cluster = start(MockCutover::new(), Some(transport));
    cluster.primary.set_checksum(7);
    cluster.mirror.set_checksum(1);

    while mirror_link.delivered().is_empty() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let (_, payload) = &mirror_link.delivered()[0];
    match postcard::from_bytes::<UploadPayload>(payload).unwrap() {
        UploadPayload::MirrorSync(request) => {
            assert_eq!(request.primary, PRIMARY);
            assert_eq!(request.primary_checksum, 7);
        }
        other => panic!("unexpected payload {other:?}"),
    }
    assert!(primary_link.delivered().is_empty());

    // rate limited: no second request inside the sync interval
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(mirror_link.delivered().len(), 1);

    transport_cancel.cancel();
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::eyre;
use loam_core::codec::DeltaEncoder;
use loam_core::{EndpointId, GatewayId, NodeRole};
use loam_dispatch::{
    AlertConfig, AlertSink, Backhaul, Config, Cutover, CutoverConfig, EdgeConfig, EdgeSource,
    GatewayState, HeartbeatConfig, HeartbeatPoller, HeartbeatSource, LinkConfig, LogAlertSink,
    LogCutover, MockBackhaul, MockFleet, MockHeartbeatSource, MockLinkMode, NodeSpec,
    Orchestrator, PipelineStats, RpcHeartbeatSource, TcpBackhaul, Transport, WebhookAlertSink,
    WebhookCutover, WriteGate, api, run_pipeline,
};
use loam_edge::SamplingController;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "loam-dispatch")]
#[command(about = "Loam gateway: edge telemetry transport and failover supervision")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "loam-dispatch.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,loam_dispatch=info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        info!(path = ?cli.config, "Loading configuration");
        Config::load(&cli.config)?
    } else {
        info!("No configuration file found, using defaults");
        Config::default()
    };

    let gateway_id = GatewayId(
        config
            .gateway
            .id
            .parse()
            .map_err(|e| eyre!("invalid gateway ID '{}': {}", config.gateway.id, e))?,
    );

    info!(
        gateway_id = ?gateway_id,
        http_addr = %config.server.http_addr,
        endpoints = config.endpoints.len(),
        nodes = config.nodes.len(),
        "Starting loam-dispatch"
    );

    run_gateway(config, gateway_id).await
}

async fn run_gateway(config: Config, gateway_id: GatewayId) -> color_eyre::Result<()> {
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let sampling = Arc::new(SamplingController::new(config.sampling.clone())?);
    let encoder = Arc::new(DeltaEncoder::new(config.codec));
    let gate = WriteGate::new(true);

    let send_timeout = Duration::from_millis(config.transport.send_timeout_ms);
    let links = config
        .endpoints
        .iter()
        .map(|endpoint| {
            let link: Arc<dyn Backhaul> = match endpoint.link {
                LinkConfig::Mock { loss } if loss > 0.0 => {
                    Arc::new(MockBackhaul::new(MockLinkMode::Lossy(loss)))
                }
                LinkConfig::Mock { .. } => Arc::new(MockBackhaul::healthy()),
                LinkConfig::Tcp { addr } => {
                    Arc::new(TcpBackhaul::new(addr, gateway_id, send_timeout))
                }
            };
            info!(endpoint_id = endpoint.id, name = %endpoint.name, "configured endpoint");
            (EndpointId(endpoint.id), endpoint.name.clone(), link)
        })
        .collect();

    let transport = Transport::new(config.transport.clone(), links, gate.clone())?;
    let mut transport_tasks = transport.start(cancel.clone());

    let alerts: Arc<dyn AlertSink> = match &config.alert {
        AlertConfig::Log => Arc::new(LogAlertSink),
        AlertConfig::Webhook { url } => Arc::new(WebhookAlertSink::new(url)),
    };
    let cutover: Arc<dyn Cutover> = match &config.cutover {
        CutoverConfig::Log => Arc::new(LogCutover),
        CutoverConfig::Webhook { url } => Arc::new(WebhookCutover::new(url)),
    };

    let specs: Vec<NodeSpec> = config
        .nodes
        .iter()
        .map(|node| NodeSpec {
            endpoint: node.endpoint_id(),
            rpc_addr: node.rpc_addr(),
            ..NodeSpec::new(node.node_id(), node.role)
        })
        .collect();

    let (orchestrator, failover) =
        Orchestrator::new(config.failover.clone(), &specs, gate, alerts, cutover)?;
    tasks.spawn(
        orchestrator
            .with_transport(transport.clone())
            .run(cancel.clone()),
    );

    let poll_interval = Duration::from_millis(config.failover.poll_interval_ms);
    let heartbeat_timeout = Duration::from_millis(config.failover.heartbeat_interval_ms);
    for node in &config.nodes {
        let source: Arc<dyn HeartbeatSource> = match node.heartbeat {
            // A simulated cold spare stays powered down.
            HeartbeatConfig::Mock => Arc::new(MockHeartbeatSource::new(
                node.node_id(),
                node.role != NodeRole::ColdSpare,
            )),
            HeartbeatConfig::Rpc { addr } => Arc::new(RpcHeartbeatSource::new(
                addr,
                gateway_id,
                heartbeat_timeout,
            )),
        };
        let poller =
            HeartbeatPoller::new(node.node_id(), source, poll_interval, failover.heartbeats());
        tasks.spawn(poller.run(cancel.clone()));
    }

    let pipeline = Arc::new(PipelineStats::default());
    match config.edge {
        EdgeConfig::Mock {
            device_count,
            field_count,
            poll_interval_ms,
            max_batch,
        } => {
            info!(device_count, field_count, poll_interval_ms, "Using simulated fleet");

            let fleet = Arc::new(
                MockFleet::new(
                    sampling.clone(),
                    encoder,
                    device_count,
                    field_count,
                    Duration::from_millis(poll_interval_ms),
                )
                .with_max_batch(max_batch),
            );
            let batches = fleet.start(cancel.clone()).await?;
            tasks.spawn(run_pipeline(
                fleet,
                batches,
                transport.clone(),
                pipeline.clone(),
                cancel.clone(),
            ));
        }
    }

    let state = GatewayState::new(gateway_id, transport, failover, sampling, pipeline);

    let http_addr = config.server.http_addr;
    let axum_app = api::router(state);
    let axum_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");

    let cancel_for_http = cancel.clone();
    tokio::select! {
        result = axum::serve(axum_listener, axum_app).with_graceful_shutdown(async move {
            cancel_for_http.cancelled().await;
        }) => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server shut down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    while transport_tasks.join_next().await.is_some() {}

    info!("loam-dispatch shut down complete");
    Ok(())
}

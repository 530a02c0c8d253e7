use std::path::PathBuf;

use clap::Parser;
use loam_node::{
    Config, Ingestor, MemoryRowStorage, NodeState, RowStorage, SqliteRowStorage, StorageConfig, api,
    rpc_server, run_session_sweeper,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "loam-node")]
#[command(about = "Loam processing node: upload reconstruction, decoding and row storage")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "loam-node.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "tracing=info,loam_node=info".to_owned());
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

    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory row storage");
            serve(MemoryRowStorage::new(), &config).await
        }
        StorageConfig::Sqlite { path } => {
            info!(path = ?path, "Using SQLite row storage");
            serve(SqliteRowStorage::new(path).await?, &config).await
        }
    }
}

async fn serve<R: RowStorage>(storage: R, config: &Config) -> color_eyre::Result<()> {
    let node_id = config.node.node_id();
    let tenant = config.node.tenant_id();
    info!(
        node_id = node_id.0,
        tenant = %tenant.0,
        state_checksum = storage.checksum(),
        "Starting loam-node"
    );

    let state =
        NodeState::with_ingestor(Ingestor::new(node_id, tenant, storage).with_mirror(config.mirror));
    let shutdown = CancellationToken::new();

    let sweeper = tokio::spawn(run_session_sweeper(
        state.sessions.clone(),
        config.session.idle_timeout(),
        config.session.sweep_interval(),
        shutdown.child_token(),
    ));

    let rpc_addr = config.server.rpc_addr;
    let rpc = rpc_server(TcpListener::bind(rpc_addr).await?, state.clone());
    info!(%rpc_addr, "RPC server listening");

    let http_addr = config.server.http_addr;
    let http_listener = TcpListener::bind(http_addr).await?;
    info!(%http_addr, "HTTP server listening");
    let http_shutdown = shutdown.clone();
    let http = axum::serve(http_listener, api::router(state))
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

    tokio::select! {
        _ = rpc.serve(shutdown.clone()) => info!("RPC server stopped"),
        result = http => {
            if let Err(e) = result {
                error!(error = ?e, "HTTP server error");
            }
            info!("HTTP server stopped");
        }
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
    }

    shutdown.cancel();
    let _ = sweeper.await;
    info!("loam-node shut down complete");
    Ok(())
}

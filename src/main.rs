use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use fleet_control::build_info::{BUILD_SHA, BUILD_TIMESTAMP};
use fleet_control::clock::SystemClock;
use fleet_control::metrics::TracingMetrics;
use fleet_control::rpc_server::run_rpc_server;
use fleet_control::store::{MemoryStore, SharedStore};
use fleet_control::{ControlServer, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "Control plane for remote telemetry agents")]
#[command(version)]
struct Cli {
    /// YAML config file; defaults plus environment overrides when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent transport listen address
    #[arg(long)]
    listen: Option<String>,

    /// Control RPC listen address
    #[arg(long)]
    rpc_listen: Option<String>,

    /// Log filter, e.g. "debug" or "fleet_control=trace" (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,

    /// Keep all state in memory only
    #[arg(long)]
    no_snapshot: bool,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Writes the store to disk every `interval` until shutdown.
async fn run_snapshot_task(
    store: Arc<MemoryStore>,
    path: PathBuf,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.persist_snapshot(&path) {
                    tracing::error!(path = %path.display(), error = %e, "Failed to persist snapshot");
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::from_env(),
    };
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(rpc_listen) = cli.rpc_listen {
        config.rpc_addr = rpc_listen;
    }

    tracing::info!(
        build_sha = BUILD_SHA,
        build_timestamp = BUILD_TIMESTAMP,
        "fleetd starting"
    );

    let snapshot_path = if cli.no_snapshot {
        None
    } else {
        Some(config.resolved_snapshot_path()?)
    };
    let store = Arc::new(match &snapshot_path {
        Some(path) => MemoryStore::load_snapshot(path, Utc::now())
            .with_context(|| format!("Failed to restore snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    });
    let shared_store: SharedStore = store.clone();

    let server = Arc::new(ControlServer::new(
        &config,
        shared_store,
        Arc::new(SystemClock),
        Arc::new(TracingMetrics),
    ));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind agent transport on {}", config.listen_addr))?;

    let (rpc_token, generated) = config.rpc_token_or_generate();
    if generated {
        tracing::info!(token = %rpc_token, "Generated control RPC token");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    server.start();

    let snapshot_task = snapshot_path.clone().map(|path| {
        tokio::spawn(run_snapshot_task(
            store.clone(),
            path,
            config.snapshot_interval(),
            shutdown_tx.clone(),
        ))
    });

    let transport_server = server.clone();
    let transport_task = tokio::spawn(async move { transport_server.serve(listener).await });

    let rpc_server = server.clone();
    let rpc_addr = config.rpc_addr.clone();
    let rpc_shutdown = shutdown_tx.clone();
    let rpc_task = tokio::spawn(async move {
        run_rpc_server(rpc_server, &rpc_addr, Some(rpc_token), rpc_shutdown).await
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    server.stop().await;
    let _ = shutdown_tx.send(());

    if let Ok(Err(e)) = transport_task.await {
        tracing::error!(error = %e, "Agent transport failed");
    }
    if let Ok(Err(e)) = rpc_task.await {
        tracing::error!(error = %e, "RPC server failed");
    }
    if let Some(task) = snapshot_task {
        let _ = task.await;
    }

    if let Some(path) = &snapshot_path {
        store
            .persist_snapshot(path)
            .with_context(|| format!("Failed to persist snapshot {}", path.display()))?;
        tracing::info!(path = %path.display(), "Snapshot persisted");
    }

    Ok(())
}

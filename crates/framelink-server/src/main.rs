//! # FrameLink Server
//!
//! Single-process signaling relay:
//! - WebSocket signaling on every path, `GET /health` beside it
//! - Liveness sweep evicting silent sockets
//! - Periodic status line
//!
//! Stops on SIGTERM or Ctrl-C: the listener stops accepting and open sockets
//! are told to close.

use clap::Parser;
use framelink_signaling::{Hub, HubSettings, build_router, liveness};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "framelink", version, about = "FrameLink signaling server")]
struct Cli {
    /// Config file name or path, without extension (defaults to `framelink`)
    #[arg(short, long, env = "FRAMELINK_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = framelink_common::config::init(cli.config.as_deref())?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "framelink=debug,tower_http=info".into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    }

    tracing::info!("Starting FrameLink signaling v{}", env!("CARGO_PKG_VERSION"));

    let hub = Arc::new(Hub::new(HubSettings::from_config(config)));

    // === Background tasks ===
    let sweeper = liveness::spawn(hub.clone(), config.liveness.interval());
    let reporter = spawn_status_reporter(
        hub.clone(),
        Duration::from_secs(config.server.status_interval_secs),
    );

    // === HTTP + WebSocket ===
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("WebSocket endpoint: ws://{addr}");
    tracing::info!("Health check: http://{addr}/health");

    axum::serve(
        listener,
        build_router(hub.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let hub = hub.clone();
        async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by the listener; close them here
            hub.close_all().await;
        }
    })
    .await?;

    sweeper.abort();
    reporter.abort();
    tracing::info!("Server closed");

    Ok(())
}

/// Log connection and room counts every `interval`.
fn spawn_status_reporter(hub: Arc<Hub>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let stats = hub.stats().await;
            tracing::info!(
                connections = stats.connections,
                in_rooms = stats.in_rooms,
                external = stats.external,
                rooms = stats.rooms,
                "Status"
            );
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, shutting down gracefully"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down gracefully"),
    }
}

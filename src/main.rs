//! `envd` — in-sandbox execution daemon. CLI bootstrap, tracing setup, and
//! the main loop: bind the HTTP surface, serve until SIGINT/SIGTERM, then
//! drive the process manager's shutdown.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use envd::http;
use envd_core::{ManagerConfig, ProcessManager};

/// In-sandbox execution daemon.
#[derive(Debug, Parser)]
#[command(name = "envd", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Root directory for per-process filesystem views.
    #[arg(long, default_value = "/tmp/envd")]
    base_dir: PathBuf,

    /// Bounded queue capacity per BCAST subscriber.
    #[arg(long, default_value_t = 16)]
    subscriber_capacity: usize,

    /// Reconcile loop period, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    reconcile_interval_ms: u64,

    /// Optional cap on bytes buffered per output stream before truncation.
    #[arg(long)]
    max_output_bytes: Option<u64>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("envd=info,envd_core=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    tokio::fs::create_dir_all(&cli.base_dir)
        .await
        .with_context(|| format!("creating base dir {}", cli.base_dir.display()))?;

    let manager = ProcessManager::new(ManagerConfig {
        base_dir: cli.base_dir.clone(),
        subscriber_capacity: cli.subscriber_capacity,
        reconcile_interval: Duration::from_millis(cli.reconcile_interval_ms),
        max_output_bytes: cli.max_output_bytes,
    });

    let router = http::create_router(http::AppState {
        manager: manager.clone(),
    });

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;

    tracing::info!(addr = %cli.listen, base_dir = %cli.base_dir.display(), "envd listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    tracing::info!("shutting down, killing remaining processes");
    manager.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

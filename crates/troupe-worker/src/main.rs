//! `troupe-worker` -- local worker supervisor service.
//!
//! A single long-running process: loads configuration from the
//! environment, verifies the external tool, the repository, and the
//! bus, then executes tasks one at a time until SIGINT/SIGTERM (or a
//! shutdown command on the broadcast channel). A task in flight at
//! shutdown gets up to 30 seconds to finish naturally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troupe_bus::{Bus, RedisBus};
use troupe_types::config::WorkerConfig;
use troupe_worker::{run_startup_checks, Supervisor};

/// How long a running task may finish naturally after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Worker supervisor service for the troupe platform.
#[derive(Parser)]
#[command(name = "troupe-worker", version, about)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let config = WorkerConfig::from_env().context("configuration error")?;

    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&config.bus)
            .await
            .context("failed to connect to the bus")?,
    );

    run_startup_checks(&config, bus.as_ref())
        .await
        .context("startup checks failed")?;

    let supervisor = Arc::new(Supervisor::new(&config, bus.clone()));
    let cancel = CancellationToken::new();
    supervisor
        .start(cancel.clone())
        .await
        .context("failed to subscribe bus channels")?;
    info!(
        agent = %config.agent_name,
        repo = %config.repo_path.display(),
        tool = %config.tool_bin,
        "worker running"
    );

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();

    supervisor.begin_shutdown();
    supervisor.publish_status().await;
    if supervisor.is_working() {
        info!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "task in flight, waiting for it to finish"
        );
        if !supervisor.wait_idle(SHUTDOWN_GRACE).await {
            warn!("task did not finish within the grace period");
        }
    }

    supervisor.go_offline().await;
    bus.close().await;
    info!("worker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("received shutdown signal");
}

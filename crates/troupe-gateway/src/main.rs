//! `troupe-gateway` -- WebSocket/HTTP gateway service.
//!
//! A single long-running process: loads configuration from the
//! environment, connects the bus and the activity store, serves
//! `/stream` and `/api/health`, and exits 0 on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use troupe_bus::{Bus, RedisBus};
use troupe_gateway::{router, start_forwarding, GatewayState};
use troupe_store::{ActivityStore, NullStore, RestStore};
use troupe_types::config::GatewayConfig;

/// Gateway service for the troupe platform.
#[derive(Parser)]
#[command(name = "troupe-gateway", version, about)]
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

    let config = GatewayConfig::from_env().context("configuration error")?;

    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&config.bus)
            .await
            .context("failed to connect to the bus")?,
    );

    let store: Arc<dyn ActivityStore> = match &config.store {
        Some(settings) => Arc::new(RestStore::new(settings)),
        None => {
            warn!("activity store not configured, logging disabled");
            Arc::new(NullStore)
        }
    };

    let state = GatewayState::new(&config.agent_name, bus.clone(), store);
    start_forwarding(&state, &config.forward_channels)
        .await
        .context("failed to subscribe forward channels")?;

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    info!(
        port = config.port,
        forward_channels = ?config.forward_channels,
        "gateway listening"
    );

    axum::serve(listener, router(state, &config))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;

    bus.close().await;
    info!("gateway shutdown complete");
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

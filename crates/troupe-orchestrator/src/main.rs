//! `troupe-orchestrator` -- conversational orchestrator service.
//!
//! A single long-running process: loads configuration from the
//! environment, connects the bus, the activity store, and the LLM
//! provider, then runs the turn loop until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use troupe_bus::{Bus, RedisBus};
use troupe_llm::AnthropicModel;
use troupe_orchestrator::Orchestrator;
use troupe_store::{ActivityStore, NullStore, RestStore};
use troupe_types::config::OrchestratorConfig;

/// Orchestrator service for the troupe platform.
#[derive(Parser)]
#[command(name = "troupe-orchestrator", version, about)]
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

    let config = OrchestratorConfig::from_env().context("configuration error")?;

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

    let model = Arc::new(AnthropicModel::new(&config.llm));
    let orchestrator = Orchestrator::new(&config, bus.clone(), store, model);

    let cancel = CancellationToken::new();
    let turn_loop = orchestrator
        .start(cancel.clone())
        .await
        .context("failed to subscribe bus channels")?;
    info!(agent = %config.agent_name, model = %config.llm.model, "orchestrator running");

    shutdown_signal().await;
    cancel.cancel();
    let _ = turn_loop.await;

    bus.close().await;
    info!("orchestrator shutdown complete");
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

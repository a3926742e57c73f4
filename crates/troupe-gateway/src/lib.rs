//! # troupe-gateway
//!
//! The browser-facing edge of the troupe platform: a WebSocket stream
//! endpoint fanning the bus out to clients and client messages into the
//! bus, an activity log, and a health surface.
//!
//! The binary in `main.rs` wires configuration, the Redis bus, and the
//! REST store; everything here is transport-injected and exercised by
//! the integration tests against the in-memory bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{error, warn};

use troupe_bus::{handler, Bus, BusError};
use troupe_store::ActivityStore;
use troupe_types::config::GatewayConfig;

pub mod frames;
pub mod health;
pub mod ws;

use frames::ForwardFrame;
use ws::ClientRegistry;

/// Agent name the orchestrator claims on the bus; inbound human input
/// is addressed to it.
pub const ORCHESTRATOR_NAME: &str = "chatter";

/// Shared state behind every gateway handler.
pub struct GatewayState {
    /// Identity this gateway claims on the bus.
    pub agent_name: String,

    /// Agent that consumes `human-input`.
    pub orchestrator_name: String,

    /// Bus transport.
    pub bus: Arc<dyn Bus>,

    /// Activity-log backend.
    pub store: Arc<dyn ActivityStore>,

    /// Open WebSocket clients.
    pub clients: ClientRegistry,

    /// Keep-alive cadence per socket.
    pub heartbeat_interval: Duration,

    /// Process start, for uptime reporting.
    pub started_at: Instant,
}

impl GatewayState {
    /// Assemble state around the injected transports.
    pub fn new(
        agent_name: impl Into<String>,
        bus: Arc<dyn Bus>,
        store: Arc<dyn ActivityStore>,
    ) -> Arc<Self> {
        Self::with_heartbeat_interval(agent_name, bus, store, ws::HEARTBEAT_INTERVAL)
    }

    /// Same, with a custom keep-alive cadence (tests use a short one).
    pub fn with_heartbeat_interval(
        agent_name: impl Into<String>,
        bus: Arc<dyn Bus>,
        store: Arc<dyn ActivityStore>,
        heartbeat_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            agent_name: agent_name.into(),
            orchestrator_name: ORCHESTRATOR_NAME.to_string(),
            bus,
            store,
            clients: ClientRegistry::new(),
            heartbeat_interval,
            started_at: Instant::now(),
        })
    }
}

/// Subscribe the configured forward channels and fan every envelope out
/// to all open sockets.
pub async fn start_forwarding(
    state: &Arc<GatewayState>,
    channels: &[String],
) -> Result<(), BusError> {
    for channel in channels {
        let channel_name = channel.clone();
        let state_for_handler = state.clone();
        state
            .bus
            .subscribe(
                channel,
                handler(move |envelope| {
                    let state = state_for_handler.clone();
                    let channel = channel_name.clone();
                    async move {
                        let frame = ForwardFrame {
                            channel,
                            data: envelope,
                            timestamp: Utc::now(),
                        };
                        match serde_json::to_string(&frame) {
                            Ok(text) => {
                                state.clients.broadcast(&text);
                            }
                            Err(e) => error!(error = %e, "failed to encode forward frame"),
                        }
                    }
                }),
            )
            .await?;
    }
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin, error = %e, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Build the HTTP surface: health, stream, and (optionally) the static
/// dashboard.
pub fn router(state: Arc<GatewayState>, config: &GatewayConfig) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(health::health_handler))
        .route("/stream", get(ws::stream_handler));

    if let Some(dir) = &config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router.layer(cors_layer(&config.cors_origins)).with_state(state)
}

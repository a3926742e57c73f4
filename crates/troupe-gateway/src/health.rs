//! Health endpoint.
//!
//! `GET /api/health` probes every dependency live and reports 200 only
//! when all of them answered. Latency is `-1` for an unreachable
//! dependency.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::GatewayState;

/// One dependency's probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Whether the probe succeeded.
    pub connected: bool,

    /// Round-trip latency in milliseconds, `-1` when unreachable.
    pub latency_ms: i64,
}

impl ServiceHealth {
    fn from_probe(result: Result<Duration, impl std::fmt::Display>) -> Self {
        match result {
            Ok(latency) => Self {
                connected: true,
                latency_ms: latency.as_millis() as i64,
            },
            Err(_) => Self {
                connected: false,
                latency_ms: -1,
            },
        }
    }
}

/// WebSocket fan-out state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebsocketHealth {
    /// Open client connections.
    pub connections: usize,
}

/// Per-dependency breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Services {
    /// Pub/sub transport.
    pub bus: ServiceHealth,

    /// Activity-log backend.
    pub log_store: ServiceHealth,

    /// Browser-facing fan-out.
    pub websocket: WebsocketHealth,
}

/// The health endpoint body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthBody {
    /// `healthy` or `unhealthy`.
    pub status: String,

    /// When the probe ran.
    pub timestamp: DateTime<Utc>,

    /// Seconds since the gateway started.
    pub uptime_seconds: u64,

    /// Per-dependency state.
    pub services: Services,

    /// How long assembling this response took.
    pub response_time_ms: u64,
}

/// `GET /api/health` handler.
pub async fn health_handler(
    State(state): State<Arc<GatewayState>>,
) -> (StatusCode, Json<HealthBody>) {
    let started = Instant::now();

    let bus = ServiceHealth::from_probe(state.bus.ping().await);
    let log_store = ServiceHealth::from_probe(state.store.ping().await);
    let healthy = bus.connected && log_store.connected;

    let body = HealthBody {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: Utc::now(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        services: Services {
            bus,
            log_store,
            websocket: WebsocketHealth {
                connections: state.clients.len(),
            },
        },
        response_time_ms: started.elapsed().as_millis() as u64,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_success_maps_latency() {
        let health = ServiceHealth::from_probe(Ok::<_, String>(Duration::from_millis(7)));
        assert!(health.connected);
        assert_eq!(health.latency_ms, 7);
    }

    #[test]
    fn probe_failure_maps_minus_one() {
        let health = ServiceHealth::from_probe(Err::<Duration, _>("down"));
        assert!(!health.connected);
        assert_eq!(health.latency_ms, -1);
    }
}

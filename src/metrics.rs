//! Prometheus counters and gauges for the gateway, plus the /metrics endpoint.

use axum::extract::State;
use axum::http::StatusCode;
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

use crate::AppState;

/// Gateway-level metrics. Created once at startup and shared via Arc.
pub struct GatewayMetrics {
    /// Open WebSocket connections, registered or not.
    pub open_connections: IntGauge,
    /// Users currently present in the connection registry.
    pub online_users: IntGauge,
    pub broadcasts: IntCounter,
    pub deliveries: IntCounter,
    /// Frames dropped because a connection's outbound queue was full.
    pub dropped_frames: IntCounter,
    /// Connections reaped after a send found their channel closed.
    pub stale_reaped: IntCounter,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            open_connections: IntGauge::new(
                "ws_open_connections",
                "Open WebSocket connections",
            )?,
            online_users: IntGauge::new("ws_online_users", "Users with at least one connection")?,
            broadcasts: IntCounter::new("ws_broadcasts_total", "Broadcast fan-outs performed")?,
            deliveries: IntCounter::new(
                "ws_deliveries_total",
                "Targeted frames delivered to user connections",
            )?,
            dropped_frames: IntCounter::new(
                "ws_dropped_frames_total",
                "Frames dropped on full outbound queues",
            )?,
            stale_reaped: IntCounter::new(
                "ws_stale_connections_reaped_total",
                "Connections removed after a failed send",
            )?,
        })
    }

    pub fn register_on(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.open_connections.clone()))?;
        registry.register(Box::new(self.online_users.clone()))?;
        registry.register(Box::new(self.broadcasts.clone()))?;
        registry.register(Box::new(self.deliveries.clone()))?;
        registry.register(Box::new(self.dropped_frames.clone()))?;
        registry.register(Box::new(self.stale_reaped.clone()))?;
        Ok(())
    }
}

/// GET /metrics — Prometheus text exposition.
pub async fn metrics_handler(
    State(state): State<AppState>,
) -> Result<String, (StatusCode, &'static str)> {
    TextEncoder::new()
        .encode_to_string(&state.metrics_registry.gather())
        .map_err(|e| {
            tracing::error!("encode metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        })
}

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod auth;
mod events;
mod gateway;
mod handlers;
mod metrics;
mod registry;
mod store;

use auth::SessionVerifier;
use gateway::PresenceGateway;
use metrics::GatewayMetrics;
use store::InMemoryMessageStore;

/// Cap on messages returned per conversation fetch.
pub const MAX_MESSAGES_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<PresenceGateway>,
    pub store: Arc<InMemoryMessageStore>,
    pub verifier: Arc<SessionVerifier>,
    pub metrics_registry: prometheus::Registry,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let jwt_secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let metrics_registry = prometheus::Registry::new();
    let gateway_metrics = GatewayMetrics::new().expect("Failed to create metrics");
    gateway_metrics
        .register_on(&metrics_registry)
        .expect("Failed to register metrics");

    let state = AppState {
        gateway: Arc::new(PresenceGateway::new(Arc::new(gateway_metrics))),
        store: Arc::new(InMemoryMessageStore::new()),
        verifier: Arc::new(SessionVerifier::new(&jwt_secret)),
        metrics_registry,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(handlers::ws::ws_handler))
        .route("/online", get(handlers::ws::get_online))
        .route("/messages", post(handlers::messages::post_message))
        .route("/messages/{peer_id}", get(handlers::messages::get_conversation))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = bind_addr.parse().expect("BIND_ADDR must be host:port");
    tracing::info!(%addr, "sitechat backend listening");
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

async fn health() -> &'static str {
    "ok"
}

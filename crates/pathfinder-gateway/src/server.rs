//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::{handle_browser_connection, handle_robot_connection, MAX_PAYLOAD};
use crate::liveness::spawn_liveness_monitor;
use crate::state::GatewayState;

/// Build the router: `/ws` for browsers, `/robot` for robots, `/health`.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let router = Router::new()
        .route("/ws", get(browser_ws_handler))
        .route("/robot", get(robot_ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Start the coordinator and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    start_gateway_with_shutdown(state, port, shutdown_signal()).await
}

/// Start the coordinator and serve until `shutdown` resolves.
pub async fn start_gateway_with_shutdown(
    state: Arc<GatewayState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr();
    let cancel = CancellationToken::new();
    let monitor = spawn_liveness_monitor(state.clone(), cancel.clone());

    let app = build_router(state);
    let addr = format!("{bind_addr}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Coordinator listening on {addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    cancel.cancel();
    let _ = monitor.await;
    result?;
    Ok(())
}

#[derive(serde::Deserialize)]
struct BrowserQuery {
    token: Option<String>,
}

async fn browser_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<BrowserQuery>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD)
        .on_upgrade(move |socket| handle_browser_connection(state, socket, query.token))
}

async fn robot_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_PAYLOAD)
        .on_upgrade(move |socket| handle_robot_connection(state, socket))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let version = env!("CARGO_PKG_VERSION");
    let coordinator = state.coordinator.read().await;

    axum::Json(json!({
        "status": "ok",
        "version": version,
        "connections": coordinator.registry.connection_count(),
        "robots_online": coordinator.registry.online_robot_count(),
        "sessions": coordinator.bindings.len(),
        "active_jobs": coordinator.active_jobs(),
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => handle.render(),
        None => String::new(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

use std::{future::Future, net::SocketAddr};

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    application::state::SharedState,
    domain::error::DomainError,
    interfaces::{agent_api, agent_ws},
};

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/info", get(info_handler))
        .route("/api/agent/ws", get(agent_ws::ws_handler))
        .route("/api/agent/register", post(agent_api::register_handler))
        .route("/api/agent/heartbeat", post(agent_api::heartbeat_handler))
        .route("/api/agent/tasks", get(agent_api::tasks_handler))
        .route("/api/agent/report", post(agent_api::report_handler))
        .route("/api/agent/version", get(agent_api::version_handler))
        .route("/api/agent/download", get(agent_api::download_handler))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DomainError> {
    let local_addr = listener.local_addr().map_err(|error| {
        DomainError::Unavailable(format!("failed to read listener address: {error}"))
    })?;

    info!(
        "baihu-server listening on http://{}:{}",
        local_addr.ip(),
        local_addr.port()
    );

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|error| DomainError::Unavailable(format!("server runtime error: {error}")))
}

async fn healthz_handler(State(state): State<SharedState>) -> impl IntoResponse {
    match state.health_payload().await {
        Ok(payload) => (StatusCode::OK, Json(payload)).into_response(),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "ok": false,
                "error": error.to_string(),
            })),
        )
            .into_response(),
    }
}

async fn readyz_handler(State(state): State<SharedState>) -> impl IntoResponse {
    let connections = state.online_conn_count().await;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "ready": true,
            "uptime_ms": state.uptime_ms(),
            "agents_online": connections,
        })),
    )
}

async fn info_handler(State(state): State<SharedState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "name": "baihu-server",
            "version": state.config().runtime_version,
            "workers": state.config().dispatch.worker_count,
            "queue_size": state.config().dispatch.queue_size,
            "rate_interval_ms": state.config().dispatch.rate_interval_ms,
            "demo_mode": state.config().demo_mode,
        })),
    )
}

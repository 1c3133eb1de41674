use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    application::state::SharedState,
    domain::{
        error::DomainError,
        models::{AgentRecord, TaskResultReport},
    },
    protocol::HeartbeatPayload,
};

const BUNDLE_PREFIX: &str = "baihu-agent-";
const BUNDLE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_arch")]
    pub arch: String,
}

fn default_os() -> String {
    "linux".to_owned()
}

fn default_arch() -> String {
    "amd64".to_owned()
}

/// `POST /api/agent/register` — HTTP enrollment, same semantics as the
/// WebSocket first contact.
pub async fn register_handler(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Response {
    if body.token.trim().is_empty() {
        return error_response(&DomainError::InvalidRequest("token is required".to_owned()));
    }
    let machine_id = machine_id_header(&headers);
    let ip = addr.ip().to_string();

    match state
        .register_agent_by_token(body.token.trim(), &machine_id, &ip)
        .await
    {
        Ok(registration) => (
            StatusCode::OK,
            Json(json!({
                "agent_id": registration.agent.id,
                "token": registration.agent.token,
                "message": if registration.is_new { "registered" } else { "reused" },
            })),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

/// `POST /api/agent/heartbeat` — fallback for agents without a live
/// WebSocket; responds with the same ack body as the `heartbeat_ack` frame.
pub async fn heartbeat_handler(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<HeartbeatPayload>,
) -> Response {
    let agent = match authorize(&state, &headers).await {
        Ok(agent) => agent,
        Err(error) => return error_response(&error),
    };

    let ip = addr.ip().to_string();
    let agent = match state.agent_heartbeat(agent.id, &ip, &payload).await {
        Ok(agent) => agent,
        Err(error) => return error_response(&error),
    };

    match state.heartbeat_ack(&agent, &payload.version).await {
        Ok(ack) => (StatusCode::OK, Json(json!(ack))).into_response(),
        Err(error) => error_response(&error),
    }
}

/// `GET /api/agent/tasks` — the agent's current task set.
pub async fn tasks_handler(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let agent = match authorize(&state, &headers).await {
        Ok(agent) => agent,
        Err(error) => return error_response(&error),
    };
    if !agent.enabled {
        return error_response(&DomainError::AgentDisabled);
    }

    match state.agent_task_views(agent.id).await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!({ "agent_id": agent.id, "tasks": tasks })),
        )
            .into_response(),
        Err(error) => error_response(&error),
    }
}

/// `POST /api/agent/report` — result delivery when the WebSocket send
/// failed.
pub async fn report_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(report): Json<TaskResultReport>,
) -> Response {
    let agent = match authorize(&state, &headers).await {
        Ok(agent) => agent,
        Err(error) => return error_response(&error),
    };

    match state.report_agent_result(&agent, report).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "message": "reported" }))).into_response(),
        Err(error) => error_response(&error),
    }
}

/// `GET /api/agent/version` — published version plus the platform bundles
/// present on disk.
pub async fn version_handler(State(state): State<SharedState>) -> Response {
    let version = state.latest_agent_version().await;
    let platforms = list_platforms(&state).await;
    (
        StatusCode::OK,
        Json(json!({ "version": version, "platforms": platforms })),
    )
        .into_response()
}

/// `GET /api/agent/download?os&arch` — the platform tarball as an
/// attachment.
pub async fn download_handler(
    State(state): State<SharedState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let filename = format!("{BUNDLE_PREFIX}{}-{}{BUNDLE_SUFFIX}", query.os, query.arch);
    if filename.contains("..") || filename.contains('/') {
        return error_response(&DomainError::InvalidRequest("invalid platform".to_owned()));
    }

    let path = state.config().agent_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/gzip".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename={filename}"),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => error_response(&DomainError::NotFound(format!(
            "no agent bundle for {}-{}",
            query.os, query.arch
        ))),
    }
}

async fn list_platforms(state: &SharedState) -> Vec<serde_json::Value> {
    let mut platforms = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(&state.config().agent_dir).await else {
        return platforms;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name
            .strip_prefix(BUNDLE_PREFIX)
            .and_then(|rest| rest.strip_suffix(BUNDLE_SUFFIX))
        else {
            continue;
        };
        if let Some((os, arch)) = stem.split_once('-') {
            platforms.push(json!({ "os": os, "arch": arch, "filename": name }));
        }
    }
    platforms
}

/// Bearer token plus optional `X-Machine-ID`, resolved to an agent record.
async fn authorize(state: &SharedState, headers: &HeaderMap) -> Result<AgentRecord, DomainError> {
    let token = bearer_token(headers)
        .ok_or_else(|| DomainError::InvalidRequest("missing bearer token".to_owned()))?;
    let machine_id = machine_id_header(headers);
    state.resolve_agent_for_http(&token, &machine_id).await
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.split_once(' ') {
        Some(("Bearer", token)) => Some(token.trim().to_owned()),
        _ => Some(raw.to_owned()),
    }
}

fn machine_id_header(headers: &HeaderMap) -> String {
    headers
        .get("X-Machine-ID")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .trim()
        .to_owned()
}

pub fn error_response(error: &DomainError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": error.to_string() }))).into_response()
}

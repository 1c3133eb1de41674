use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use serde::Deserialize;
use tokio::{
    sync::{mpsc, watch},
    time::{MissedTickBehavior, interval, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    application::state::SharedState,
    domain::{error::DomainError, models::AgentRecord},
    interfaces::agent_api::error_response,
    protocol::{self, ConnectedPayload, FrameBody, HeartbeatPayload},
    security::rate_limit::ConnectDecision,
    storage::agent_store::AgentFacts,
};

const READ_DEADLINE: Duration = Duration::from_secs(90);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub machine_id: String,
}

/// `GET /api/agent/ws?token&machine_id` — admission control, agent
/// resolution, then the upgrade. Refusals surface as plain HTTP statuses.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    let ip = addr.ip().to_string();

    let decision = state.limiter().check(&ip).await;
    if decision != ConnectDecision::Allowed {
        warn!("connection from {ip} rate limited: {}", decision.reason());
        return error_response(&DomainError::RateLimited {
            reason: decision.reason(),
            retry_after_secs: match decision {
                ConnectDecision::Blocked { retry_after_secs } => retry_after_secs,
                _ => 5,
            },
        });
    }

    if query.token.trim().is_empty() {
        state.limiter().record_fail(&ip).await;
        return error_response(&DomainError::TokenRejected(
            crate::domain::error::TokenFailure::Unknown,
        ));
    }

    let registration = match state
        .resolve_agent_for_connect(query.token.trim(), query.machine_id.trim(), &ip)
        .await
    {
        Ok(registration) => registration,
        Err(error) => {
            state.limiter().record_fail(&ip).await;
            return error_response(&error);
        }
    };

    if !registration.agent.enabled {
        state.limiter().record_fail(&ip).await;
        return error_response(&DomainError::AgentDisabled);
    }

    let machine_id = query.machine_id.trim().to_owned();
    ws.on_upgrade(move |socket| {
        run_connection(
            socket,
            state,
            registration.agent,
            registration.is_new,
            machine_id,
            ip,
        )
    })
    .into_response()
}

async fn run_connection(
    socket: WebSocket,
    state: SharedState,
    agent: AgentRecord,
    is_new_agent: bool,
    machine_id: String,
    ip: String,
) {
    state.limiter().record_success(&ip).await;

    let guard = state.register_agent_conn(agent.id, ip.clone()).await;
    let conn_seq = guard.conn_seq;
    info!("agent #{} connected from {ip} (conn {conn_seq})", agent.id);

    if let Err(error) = state
        .store()
        .touch_agent(
            agent.id,
            &AgentFacts {
                ip: ip.clone(),
                ..AgentFacts::default()
            },
        )
        .await
    {
        warn!("agent #{} online mark failed: {error}", agent.id);
    }

    let connected = protocol::encode_frame(
        protocol::TYPE_CONNECTED,
        &ConnectedPayload {
            agent_id: agent.id,
            name: agent.name.clone(),
            is_new_agent,
            machine_id,
        },
    );
    state.send_frame_to_agent(agent.id, connected).await;

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, guard.outbound_rx, guard.close_rx.clone()));

    read_pump(&state, stream, agent.id, conn_seq, &ip, guard.close_rx).await;

    state.unregister_agent_conn(agent.id, conn_seq).await;
    writer.abort();
    let _ = writer.await;
    info!("agent #{} disconnected (conn {conn_seq})", agent.id);
}

/// Single writer for the connection: drains the outbound channel and keeps
/// the transport alive with pings, each send under the write deadline.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            _ = close_rx.changed() => break,
            frame = outbound.recv() => match frame {
                Some(text) => Message::Text(text.into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(axum::body::Bytes::new()),
        };

        match timeout(WRITE_DEADLINE, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                debug!("write pump send failed: {error}");
                break;
            }
            Err(_) => {
                debug!("write pump hit the write deadline");
                break;
            }
        }
    }

    let _ = sink.close().await;
}

async fn read_pump(
    state: &SharedState,
    mut stream: SplitStream<WebSocket>,
    agent_id: i64,
    conn_seq: u64,
    ip: &str,
    mut close_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            _ = close_rx.changed() => break,
            next = timeout(READ_DEADLINE, stream.next()) => next,
        };

        let message = match next {
            Err(_) => {
                info!("agent #{agent_id} read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(error))) => {
                debug!("agent #{agent_id} read error: {error}");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        // A displaced connection must not keep feeding frames in.
        if !state.is_current_conn(agent_id, conn_seq).await {
            debug!("agent #{agent_id} conn {conn_seq} displaced, dropping frame");
            break;
        }

        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Pong(_) => {
                state.touch_agent_conn(agent_id).await;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => break,
        };

        handle_frame(state, agent_id, ip, &text).await;
    }
}

async fn handle_frame(state: &SharedState, agent_id: i64, ip: &str, text: &str) {
    let body = match protocol::parse_frame(text) {
        Ok(body) => body,
        Err(error) => {
            debug!("agent #{agent_id} sent an unreadable frame: {error}");
            return;
        }
    };

    match body {
        FrameBody::Heartbeat(payload) => {
            state.touch_agent_conn(agent_id).await;
            handle_heartbeat(state, agent_id, ip, payload).await;
        }
        FrameBody::FetchTasks => {
            if let Err(error) = state.push_tasks_to_agent(agent_id).await {
                warn!("agent #{agent_id} task push failed: {error}");
            }
        }
        FrameBody::TaskResult(report) => {
            let agent = match state.store().get_agent(agent_id).await {
                Ok(Some(agent)) => agent,
                _ => return,
            };
            if let Err(error) = state.report_agent_result(&agent, *report).await {
                warn!("agent #{agent_id} result rejected: {error}");
            }
        }
        FrameBody::Other(kind) => debug!("agent #{agent_id} sent unknown frame type: {kind}"),
        _ => {}
    }
}

async fn handle_heartbeat(
    state: &SharedState,
    agent_id: i64,
    ip: &str,
    payload: HeartbeatPayload,
) {
    let agent = match state.agent_heartbeat(agent_id, ip, &payload).await {
        Ok(agent) => agent,
        Err(error) => {
            warn!("agent #{agent_id} heartbeat refused: {error}");
            return;
        }
    };

    match state.heartbeat_ack(&agent, &payload.version).await {
        Ok(ack) => {
            let frame = protocol::encode_frame(protocol::TYPE_HEARTBEAT_ACK, &ack);
            state.send_frame_to_agent(agent_id, frame).await;
        }
        Err(error) => warn!("agent #{agent_id} ack build failed: {error}"),
    }
}

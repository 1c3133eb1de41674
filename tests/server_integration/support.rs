use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use baihu::{
    application::{config::RuntimeConfig, state::SharedState},
    domain::models::{NewTask, TaskLogRecord},
    interfaces::http,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) struct ServerHandle {
    pub(crate) addr: SocketAddr,
    pub(crate) state: SharedState,
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
    _temp_dir: TempDir,
}

impl ServerHandle {
    pub(crate) async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(Duration::from_secs(5), &mut self.join)
            .await
            .is_err()
        {
            self.join.abort();
        }
    }

    pub(crate) fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub(crate) fn ws_url(&self, token: &str, machine_id: &str) -> String {
        format!(
            "ws://{}/api/agent/ws?token={token}&machine_id={machine_id}",
            self.addr
        )
    }
}

pub(crate) async fn spawn_server() -> ServerHandle {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose local addr");

    let temp_dir = tempfile::tempdir().expect("temp dir should be created");
    let config = RuntimeConfig::for_test(
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        addr.port(),
        temp_dir.path().to_path_buf(),
    );
    std::fs::create_dir_all(&config.scripts_dir).expect("scripts dir");
    std::fs::create_dir_all(&config.agent_dir).expect("agent dir");

    let state = SharedState::new(config).await.expect("state should build");
    state.start_runtime().await.expect("runtime should start");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let serve_state = state.clone();
    let join = tokio::spawn(async move {
        let _ = http::serve(listener, serve_state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    ServerHandle {
        addr,
        state,
        shutdown: Some(shutdown_tx),
        join,
        _temp_dir: temp_dir,
    }
}

/// Attempts the gateway upgrade; a refusal comes back as the HTTP status
/// and decoded body.
pub(crate) async fn connect_agent(
    server: &ServerHandle,
    token: &str,
    machine_id: &str,
) -> Result<WsStream, (u16, Value)> {
    match connect_async(server.ws_url(token, machine_id)).await {
        Ok((socket, _)) => Ok(socket),
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
                .unwrap_or(Value::Null);
            Err((status, body))
        }
        Err(error) => panic!("unexpected websocket failure: {error}"),
    }
}

/// Next data frame as `{"type", "data"}` JSON; transport pings are answered
/// inline.
pub(crate) async fn recv_frame(ws: &mut WsStream) -> Value {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame should arrive in time");
        let message = next
            .expect("websocket should stay open")
            .expect("websocket stream should remain valid");
        match message {
            Message::Text(text) => {
                return serde_json::from_str(text.as_ref()).expect("json frame expected");
            }
            Message::Binary(bytes) => {
                return serde_json::from_slice(bytes.as_ref()).expect("json frame expected");
            }
            Message::Ping(payload) => {
                ws.send(Message::Pong(payload))
                    .await
                    .expect("pong should send");
            }
            Message::Pong(_) => {}
            Message::Close(_) => panic!("websocket closed before frame"),
            Message::Frame(_) => {}
        }
    }
}

/// Reads frames until the requested type shows up; unrelated frames are
/// skipped.
pub(crate) async fn recv_frame_of(ws: &mut WsStream, frame_type: &str) -> Value {
    for _ in 0..16 {
        let frame = recv_frame(ws).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
    panic!("no {frame_type} frame arrived");
}

pub(crate) async fn send_frame(ws: &mut WsStream, frame_type: &str, data: Value) {
    let frame = json!({ "type": frame_type, "data": data });
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("frame should send");
}

pub(crate) fn shell_task(name: &str, command: &str, schedule: &str) -> NewTask {
    NewTask {
        name: name.to_owned(),
        command: command.to_owned(),
        schedule: schedule.to_owned(),
        timeout: 1,
        work_dir: String::new(),
        envs: String::new(),
        retention: None,
        agent_id: None,
    }
}

/// Polls until the task has at least `count` logs, newest first.
pub(crate) async fn wait_for_logs(
    state: &SharedState,
    task_id: i64,
    count: usize,
) -> Vec<TaskLogRecord> {
    for _ in 0..100 {
        let logs = state
            .store()
            .list_task_logs(task_id, None)
            .await
            .expect("logs should list");
        if logs.len() >= count {
            return logs;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("task #{task_id} never produced {count} log(s)");
}

/// The rate limiter spaces connects from one address five seconds apart;
/// tests that reconnect have to sit it out.
pub(crate) async fn wait_out_connect_interval() {
    tokio::time::sleep(Duration::from_millis(5_200)).await;
}

use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use super::support::{
    connect_agent, recv_frame_of, send_frame, spawn_server, wait_out_connect_interval,
};

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let server = spawn_server().await;
    let refusal = connect_agent(&server, "", "").await.expect_err("401 expected");
    assert_eq!(refusal.0, 401);
    server.stop().await;
}

#[tokio::test]
async fn unknown_token_is_unauthorized() {
    let server = spawn_server().await;
    let refusal = connect_agent(&server, "deadbeef", "mid-1")
        .await
        .expect_err("401 expected");
    assert_eq!(refusal.0, 401);
    assert!(refusal.1["error"]
        .as_str()
        .is_some_and(|text| text.contains("token")));
    server.stop().await;
}

#[tokio::test]
async fn repeated_failures_block_with_retry_hint() {
    let server = spawn_server().await;

    // One genuine bad-token refusal, then enough recorded failures to trip
    // the five-strike block.
    let refusal = connect_agent(&server, "badtoken", "")
        .await
        .expect_err("401 expected");
    assert_eq!(refusal.0, 401);
    for _ in 0..4 {
        server.state.limiter().record_fail("127.0.0.1").await;
    }

    let blocked = connect_agent(&server, "badtoken", "")
        .await
        .expect_err("429 expected");
    assert_eq!(blocked.0, 429);
    let reason = blocked.1["error"].as_str().expect("error body expected");
    assert!(reason.contains("retry in"), "got: {reason}");

    server.stop().await;
}

#[tokio::test]
async fn machine_identity_reuses_the_agent_and_consumes_the_token() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("s6", 2, None)
        .await
        .expect("token should be created");

    let mut first = connect_agent(&server, &enroll.token, "machine-one")
        .await
        .expect("first connect should upgrade");
    let connected = recv_frame_of(&mut first, "connected").await;
    assert_eq!(connected["data"]["is_new_agent"], true);
    let agent_id = connected["data"]["agent_id"]
        .as_i64()
        .expect("agent id expected");
    drop(first);

    wait_out_connect_interval().await;

    let mut second = connect_agent(&server, &enroll.token, "machine-one")
        .await
        .expect("second connect should upgrade");
    let connected = recv_frame_of(&mut second, "connected").await;
    assert_eq!(connected["data"]["is_new_agent"], false);
    assert_eq!(connected["data"]["agent_id"].as_i64(), Some(agent_id));

    let token = server
        .state
        .store()
        .get_enroll_token(&enroll.token)
        .await
        .expect("token should read")
        .expect("token should exist");
    assert_eq!(token.used_count, 2);

    server.stop().await;
}

#[tokio::test]
async fn new_connection_displaces_the_old_one() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("displace", 0, None)
        .await
        .expect("token should be created");

    let mut first = connect_agent(&server, &enroll.token, "machine-d")
        .await
        .expect("first connect should upgrade");
    let _ = recv_frame_of(&mut first, "connected").await;

    wait_out_connect_interval().await;

    let mut second = connect_agent(&server, &enroll.token, "machine-d")
        .await
        .expect("second connect should upgrade");
    let _ = recv_frame_of(&mut second, "connected").await;

    // The prior connection closes promptly once displaced.
    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match first.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old connection not closed within 1s");

    server.stop().await;
}

#[tokio::test]
async fn disabled_agents_are_refused_with_403() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("disabled", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-off", "10.9.9.9")
        .await
        .expect("registration should succeed");

    server
        .state
        .update_agent(registration.agent.id, "machine-off", "", false)
        .await
        .expect("disable should succeed");

    let refusal = connect_agent(&server, &registration.agent.token, "machine-off")
        .await
        .expect_err("403 expected");
    assert_eq!(refusal.0, 403);

    server.stop().await;
}

#[tokio::test]
async fn exhausted_tokens_cannot_enroll_new_machines() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("exhaust", 1, None)
        .await
        .expect("token should be created");
    server
        .state
        .register_agent_by_token(&enroll.token, "machine-a", "10.0.0.1")
        .await
        .expect("first use should succeed");

    let error = server
        .state
        .register_agent_by_token(&enroll.token, "machine-b", "10.0.0.2")
        .await
        .expect_err("second machine must be refused");
    assert!(error.to_string().contains("exhausted"));

    server.stop().await;
}

#[tokio::test]
async fn force_update_ack_fires_once() {
    let server = spawn_server().await;
    tokio::fs::write(
        server.state.config().agent_dir.join("version.txt"),
        "v2\n",
    )
    .await
    .expect("version file should write");

    let enroll = server
        .state
        .create_enroll_token("force", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-f", "10.1.1.1")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;

    server
        .state
        .set_agent_force_update(agent_id)
        .await
        .expect("flag should set");

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-f")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    send_frame(
        &mut ws,
        "heartbeat",
        serde_json::json!({
            "version": "v1",
            "build_time": "",
            "hostname": "worker",
            "os": "linux",
            "arch": "amd64",
            "auto_update": false,
        }),
    )
    .await;

    let ack = recv_frame_of(&mut ws, "heartbeat_ack").await;
    assert_eq!(ack["data"]["need_update"], true);
    assert_eq!(ack["data"]["force_update"], true);
    assert_eq!(ack["data"]["latest_version"], "v2");

    let agent = server
        .state
        .store()
        .get_agent(agent_id)
        .await
        .expect("agent should read")
        .expect("agent should exist");
    assert!(!agent.force_update, "flag must clear after delivery");

    server.stop().await;
}

#[tokio::test]
async fn update_server_lists_and_serves_bundles() {
    let server = spawn_server().await;
    let bundle = b"fake-gzip-bytes".to_vec();
    tokio::fs::write(
        server.state.config().agent_dir.join("version.txt"),
        "1.2.3\n",
    )
    .await
    .expect("version file should write");
    tokio::fs::write(
        server
            .state
            .config()
            .agent_dir
            .join("baihu-agent-linux-amd64.tar.gz"),
        &bundle,
    )
    .await
    .expect("bundle should write");

    let client = reqwest::Client::new();
    let version: serde_json::Value = client
        .get(server.http_url("/api/agent/version"))
        .send()
        .await
        .expect("version request")
        .json()
        .await
        .expect("version json");
    assert_eq!(version["version"], "1.2.3");
    let platforms = version["platforms"].as_array().expect("platform list");
    assert!(platforms
        .iter()
        .any(|p| p["os"] == "linux" && p["arch"] == "amd64"));

    let download = client
        .get(server.http_url("/api/agent/download?os=linux&arch=amd64"))
        .send()
        .await
        .expect("download request");
    assert_eq!(download.status().as_u16(), 200);
    assert_eq!(
        download
            .headers()
            .get("content-type")
            .and_then(|value| value.to_str().ok()),
        Some("application/gzip")
    );
    assert!(download
        .headers()
        .get("content-disposition")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("baihu-agent-linux-amd64.tar.gz")));
    assert_eq!(download.bytes().await.expect("bundle bytes").to_vec(), bundle);

    let missing = client
        .get(server.http_url("/api/agent/download?os=plan9&arch=mips"))
        .send()
        .await
        .expect("missing request");
    assert_eq!(missing.status().as_u16(), 404);

    server.stop().await;
}

use std::time::Duration;

use baihu::{
    application::pipeline::decompress_output,
    domain::models::{ExecStatus, NewTask, TaskPatch},
};
use serde_json::json;

use super::support::{
    connect_agent, recv_frame_of, send_frame, shell_task, spawn_server, wait_for_logs,
};

fn agent_task(name: &str, agent_id: i64) -> NewTask {
    NewTask {
        agent_id: Some(agent_id),
        ..shell_task(name, "echo remote", "0 0 5 * * *")
    }
}

#[tokio::test]
async fn fetch_tasks_returns_the_bound_set() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("fetch", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p1", "10.2.2.2")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;

    let bound = server
        .state
        .create_task(agent_task("remote-job", agent_id))
        .await
        .expect("bound task should be created");
    // Unbound tasks never appear in an agent's set.
    server
        .state
        .create_task(shell_task("local-job", "echo local", "0 0 6 * * *"))
        .await
        .expect("local task should be created");

    // Agent-bound schedules live on the agent, not in the server registry.
    assert!(!server.state.registry().is_scheduled(bound.id));

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p1")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    send_frame(&mut ws, "fetch_tasks", json!({})).await;
    let tasks = recv_frame_of(&mut ws, "tasks").await;
    let list = tasks["data"]["tasks"].as_array().expect("task list");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["id"].as_i64(), Some(bound.id));
    assert_eq!(list[0]["command"], "echo remote");

    server.stop().await;
}

#[tokio::test]
async fn task_mutations_push_a_fresh_task_set() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("push", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p2", "10.2.2.3")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p2")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    let task = server
        .state
        .create_task(agent_task("pushed-job", agent_id))
        .await
        .expect("task should be created");
    let frame = recv_frame_of(&mut ws, "tasks").await;
    assert_eq!(
        frame["data"]["tasks"][0]["id"].as_i64(),
        Some(task.id),
    );

    server
        .state
        .update_task(
            task.id,
            TaskPatch {
                command: Some("echo changed".to_owned()),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("update should succeed");
    let frame = recv_frame_of(&mut ws, "tasks").await;
    assert_eq!(frame["data"]["tasks"][0]["command"], "echo changed");

    server
        .state
        .delete_task(task.id)
        .await
        .expect("delete should succeed");
    let frame = recv_frame_of(&mut ws, "tasks").await;
    assert_eq!(
        frame["data"]["tasks"].as_array().map(Vec::len),
        Some(0)
    );

    server.stop().await;
}

#[tokio::test]
async fn reported_results_enter_the_log_pipeline() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("report", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p3", "10.2.2.4")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;
    let task = server
        .state
        .create_task(agent_task("reporting-job", agent_id))
        .await
        .expect("task should be created");

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p3")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    send_frame(
        &mut ws,
        "task_result",
        json!({
            "task_id": task.id,
            "command": "echo remote",
            "output": "remote says hi\n",
            "status": "success",
            "duration": 42,
            "exit_code": 0,
            "start_time": 1_700_000_000,
            "end_time": 1_700_000_001,
        }),
    )
    .await;

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    let log = &logs[0];
    assert_eq!(log.agent_id, Some(agent_id));
    assert_eq!(log.status, ExecStatus::Success);
    assert_eq!(log.exit_code, 0);
    assert_eq!(
        decompress_output(&log.output).expect("output should decompress"),
        "remote says hi\n"
    );
    assert_eq!(log.started_at_ms, 1_700_000_000_000);

    let task = server
        .state
        .get_task(task.id)
        .await
        .expect("task should read")
        .expect("task should exist");
    assert!(task.last_run_ms.is_some());

    server.stop().await;
}

#[tokio::test]
async fn results_for_unbound_tasks_are_rejected() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("reject", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p4", "10.2.2.5")
        .await
        .expect("registration should succeed");

    let local_task = server
        .state
        .create_task(shell_task("not-yours", "echo mine", "0 0 7 * * *"))
        .await
        .expect("task should be created");

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p4")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    send_frame(
        &mut ws,
        "task_result",
        json!({
            "task_id": local_task.id,
            "command": "echo mine",
            "output": "spoofed",
            "status": "success",
            "duration": 1,
            "exit_code": 0,
            "start_time": 1_700_000_000,
            "end_time": 1_700_000_001,
        }),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let logs = server
        .state
        .store()
        .list_task_logs(local_task.id, None)
        .await
        .expect("logs should list");
    assert!(logs.is_empty(), "spoofed result must not be persisted");

    server.stop().await;
}

#[tokio::test]
async fn toggling_the_agent_sends_disable_and_enable_frames() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("toggle", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p5", "10.2.2.6")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p5")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    server
        .state
        .update_agent(agent_id, "worker-5", "", false)
        .await
        .expect("disable should succeed");
    let _ = recv_frame_of(&mut ws, "disabled").await;

    server
        .state
        .update_agent(agent_id, "worker-5", "", true)
        .await
        .expect("enable should succeed");
    let _ = recv_frame_of(&mut ws, "enabled").await;
    // Enabling is followed by a full task set.
    let _ = recv_frame_of(&mut ws, "tasks").await;

    server.stop().await;
}

#[tokio::test]
async fn manual_trigger_pushes_execute_to_the_agent() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("exec", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p6", "10.2.2.7")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;
    let task = server
        .state
        .create_task(agent_task("exec-job", agent_id))
        .await
        .expect("task should be created");

    let mut ws = connect_agent(&server, &registration.agent.token, "machine-p6")
        .await
        .expect("connect should upgrade");
    let _ = recv_frame_of(&mut ws, "connected").await;

    let result = server
        .state
        .run_task_now(task.id)
        .await
        .expect("trigger should succeed");
    assert!(result.is_none(), "remote triggers have no inline result");

    let frame = recv_frame_of(&mut ws, "execute").await;
    assert_eq!(frame["data"]["task_id"].as_i64(), Some(task.id));

    server.stop().await;
}

#[tokio::test]
async fn http_fallback_covers_register_tasks_report_and_heartbeat() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("http", 0, None)
        .await
        .expect("token should be created");
    let client = reqwest::Client::new();

    let registered: serde_json::Value = client
        .post(server.http_url("/api/agent/register"))
        .header("X-Machine-ID", "machine-h1")
        .json(&json!({ "token": enroll.token }))
        .send()
        .await
        .expect("register request")
        .json()
        .await
        .expect("register json");
    let agent_id = registered["agent_id"].as_i64().expect("agent id");
    let agent_token = registered["token"].as_str().expect("agent token").to_owned();

    let task = server
        .state
        .create_task(agent_task("http-job", agent_id))
        .await
        .expect("task should be created");

    let tasks: serde_json::Value = client
        .get(server.http_url("/api/agent/tasks"))
        .bearer_auth(&agent_token)
        .header("X-Machine-ID", "machine-h1")
        .send()
        .await
        .expect("tasks request")
        .json()
        .await
        .expect("tasks json");
    assert_eq!(tasks["agent_id"].as_i64(), Some(agent_id));
    assert_eq!(tasks["tasks"][0]["id"].as_i64(), Some(task.id));

    let reported = client
        .post(server.http_url("/api/agent/report"))
        .bearer_auth(&agent_token)
        .json(&json!({
            "task_id": task.id,
            "command": "echo remote",
            "output": "via http\n",
            "status": "failed",
            "duration": 9,
            "exit_code": 3,
            "start_time": 1_700_000_000,
            "end_time": 1_700_000_001,
        }))
        .send()
        .await
        .expect("report request");
    assert_eq!(reported.status().as_u16(), 200);

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs[0].status, ExecStatus::Failed);
    assert_eq!(logs[0].exit_code, 3);

    let heartbeat: serde_json::Value = client
        .post(server.http_url("/api/agent/heartbeat"))
        .bearer_auth(&agent_token)
        .json(&json!({
            "version": "0.4.0",
            "build_time": "",
            "hostname": "http-worker",
            "os": "linux",
            "arch": "amd64",
            "auto_update": false,
        }))
        .send()
        .await
        .expect("heartbeat request")
        .json()
        .await
        .expect("heartbeat json");
    assert_eq!(heartbeat["agent_id"].as_i64(), Some(agent_id));
    assert_eq!(heartbeat["need_update"], false);

    let agent = server
        .state
        .store()
        .get_agent(agent_id)
        .await
        .expect("agent should read")
        .expect("agent should exist");
    assert_eq!(agent.status, "online");
    assert_eq!(agent.hostname, "http-worker");

    let unauthorized = client
        .get(server.http_url("/api/agent/tasks"))
        .bearer_auth("wrong-token")
        .send()
        .await
        .expect("unauthorized request");
    assert_eq!(unauthorized.status().as_u16(), 401);

    server.stop().await;
}

#[tokio::test]
async fn deleting_an_agent_with_bound_tasks_is_refused() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("guard", 0, None)
        .await
        .expect("token should be created");
    let registration = server
        .state
        .register_agent_by_token(&enroll.token, "machine-p7", "10.2.2.8")
        .await
        .expect("registration should succeed");
    let agent_id = registration.agent.id;

    let task = server
        .state
        .create_task(agent_task("anchor", agent_id))
        .await
        .expect("task should be created");

    let error = server
        .state
        .delete_agent(agent_id)
        .await
        .expect_err("delete must be refused");
    assert!(error.to_string().contains("bound tasks"));

    server
        .state
        .delete_task(task.id)
        .await
        .expect("task delete should succeed");
    server
        .state
        .delete_agent(agent_id)
        .await
        .expect("agent delete should now succeed");

    server.stop().await;
}

use std::time::Duration;

use baihu::{
    agentd::{config::AgentConfig, runtime::AgentRuntime},
    application::pipeline::decompress_output,
    domain::models::{ExecStatus, NewTask},
};

use super::support::{shell_task, spawn_server, wait_for_logs};

/// The full remote loop with the real client runtime: enroll over the
/// gateway, receive the pushed task set, fire it on the local schedule,
/// and report the result back into the server's log pipeline.
#[tokio::test]
async fn agent_runtime_executes_pushed_tasks_end_to_end() {
    let server = spawn_server().await;
    let enroll = server
        .state
        .create_enroll_token("runtime", 0, None)
        .await
        .expect("token should be created");

    let config = AgentConfig {
        server_url: format!("http://{}", server.addr),
        name: "rt-worker".to_owned(),
        token: enroll.token.clone(),
        interval_secs: 1,
        auto_update: false,
    };
    let runtime = AgentRuntime::new(config, "machine-rt-e2e".to_owned());
    let schedule = runtime.schedule();
    let driver = tokio::spawn(async move { runtime.run().await });

    // The first connect enrolls the agent.
    let agent_id = {
        let mut found = None;
        for _ in 0..100 {
            let agents = server
                .state
                .store()
                .list_agents()
                .await
                .expect("agents should list");
            if let Some(agent) = agents
                .iter()
                .find(|agent| agent.machine_id == "machine-rt-e2e")
            {
                found = Some(agent.id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        found.expect("agent should enroll")
    };

    let task = server
        .state
        .create_task(NewTask {
            agent_id: Some(agent_id),
            ..shell_task("rt-echo", "echo remote-e2e", "* * * * * *")
        })
        .await
        .expect("task should be created");

    // The push lands on the runtime's local schedule...
    for _ in 0..100 {
        if schedule.get(task.id).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(schedule.get(task.id).is_some(), "task never reached the agent");

    // ...and the next fire comes back as a persisted log.
    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs[0].agent_id, Some(agent_id));
    assert_eq!(logs[0].status, ExecStatus::Success);
    assert_eq!(
        decompress_output(&logs[0].output).expect("output should decompress"),
        "remote-e2e\n"
    );

    // Heartbeats keep the agent marked online.
    let agent = server
        .state
        .store()
        .get_agent(agent_id)
        .await
        .expect("agent should read")
        .expect("agent should exist");
    assert_eq!(agent.status, "online");

    driver.abort();
    let _ = driver.await;
    server.stop().await;
}

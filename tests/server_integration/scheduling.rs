use baihu::{
    application::pipeline::decompress_output,
    domain::models::{ExecStatus, RetentionPolicy, TaskPatch},
};

use super::support::{shell_task, spawn_server, wait_for_logs};

#[tokio::test]
async fn manual_trigger_records_a_success_log() {
    let server = spawn_server().await;
    let task = server
        .state
        .create_task(shell_task("hello", "echo hello", "0 0 0 1 1 *"))
        .await
        .expect("task should be created");

    let result = server
        .state
        .run_task_now(task.id)
        .await
        .expect("trigger should succeed")
        .expect("local run returns a result");
    assert_eq!(result.status, ExecStatus::Success);

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs.len(), 1);
    let log = &logs[0];
    assert_eq!(log.status, ExecStatus::Success);
    assert_eq!(log.exit_code, 0);
    assert!(log.duration_ms >= 0);
    assert_eq!(
        decompress_output(&log.output).expect("output should decompress"),
        "hello\n"
    );

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
async fn invalid_schedule_is_refused_at_admission() {
    let server = spawn_server().await;
    let error = server
        .state
        .create_task(shell_task("broken", "echo x", "not a cron"))
        .await
        .expect_err("admission must fail");
    assert!(error.to_string().contains("invalid schedule"));
    server.stop().await;
}

#[tokio::test]
async fn cron_fire_flows_through_queue_and_pipeline() {
    let server = spawn_server().await;
    let task = server
        .state
        .create_task(shell_task("ticker", "echo tick", "* * * * * *"))
        .await
        .expect("task should be created");

    assert!(server.state.registry().is_scheduled(task.id));

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs[0].status, ExecStatus::Success);
    assert_eq!(
        decompress_output(&logs[0].output).expect("output should decompress"),
        "tick\n"
    );

    server.stop().await;
}

#[tokio::test]
async fn unchanged_schedule_and_command_keep_the_entry() {
    let server = spawn_server().await;
    let task = server
        .state
        .create_task(shell_task("steady", "echo steady", "0 0 3 * * *"))
        .await
        .expect("task should be created");

    let before = server.state.registry().list_active();
    let fire_before = before.get(&task.id).copied().expect("entry expected");

    server
        .state
        .update_task(
            task.id,
            TaskPatch {
                name: Some("steady renamed".to_owned()),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("update should succeed");

    let after = server.state.registry().list_active();
    assert_eq!(after.get(&task.id).copied(), Some(fire_before));

    server
        .state
        .update_task(
            task.id,
            TaskPatch {
                enabled: Some(false),
                ..TaskPatch::default()
            },
        )
        .await
        .expect("disable should succeed");
    assert!(!server.state.registry().is_scheduled(task.id));

    server.stop().await;
}

#[tokio::test]
async fn deleting_a_task_unschedules_it() {
    let server = spawn_server().await;
    let task = server
        .state
        .create_task(shell_task("doomed", "echo doomed", "0 0 4 * * *"))
        .await
        .expect("task should be created");
    assert!(server.state.registry().is_scheduled(task.id));

    assert!(server
        .state
        .delete_task(task.id)
        .await
        .expect("delete should succeed"));
    assert!(!server.state.registry().is_scheduled(task.id));

    server.stop().await;
}

#[tokio::test]
async fn count_retention_keeps_the_newest_logs() {
    let server = spawn_server().await;
    let mut new_task = shell_task("rotated", "echo run", "0 0 0 1 1 *");
    new_task.retention = Some(RetentionPolicy::ByCount { keep_last: 3 });
    let task = server
        .state
        .create_task(new_task)
        .await
        .expect("task should be created");

    for _ in 0..5 {
        server
            .state
            .run_task_now(task.id)
            .await
            .expect("trigger should succeed");
    }

    let logs = server
        .state
        .store()
        .list_task_logs(task.id, None)
        .await
        .expect("logs should list");
    assert_eq!(logs.len(), 3);

    // Newest-first listing; the three survivors are the highest ids.
    let ids = logs.iter().map(|log| log.id).collect::<Vec<_>>();
    assert!(ids.windows(2).all(|pair| pair[0] > pair[1]));
    let total = server
        .state
        .store()
        .count_task_logs(task.id)
        .await
        .expect("count should work");
    assert_eq!(total, 3);

    server.stop().await;
}

#[tokio::test]
async fn age_retention_deletes_old_rows() {
    use baihu::storage::log_store::NewTaskLog;

    let server = spawn_server().await;
    let log = NewTaskLog {
        task_id: 42,
        agent_id: None,
        command: "echo old".to_owned(),
        output: Vec::new(),
        status: ExecStatus::Success,
        duration_ms: 1,
        exit_code: 0,
        started_at_ms: 0,
        ended_at_ms: 0,
    };
    server
        .state
        .store()
        .insert_task_log(&log)
        .await
        .expect("insert should work");

    let now_plus = baihu::storage::now_unix_ms() + 10_000;
    let deleted = server
        .state
        .store()
        .delete_task_logs_before(42, now_plus)
        .await
        .expect("delete should work");
    assert_eq!(deleted, 1);

    server.stop().await;
}

#[tokio::test]
async fn failing_command_is_logged_with_error_footer() {
    let server = spawn_server().await;
    let task = server
        .state
        .create_task(shell_task("faulty", "echo doing; exit 7", "0 0 0 1 1 *"))
        .await
        .expect("task should be created");

    server
        .state
        .run_task_now(task.id)
        .await
        .expect("trigger should succeed");

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs[0].status, ExecStatus::Failed);
    assert_eq!(logs[0].exit_code, 7);
    let output = decompress_output(&logs[0].output).expect("output should decompress");
    assert!(output.contains("doing"));
    assert!(output.contains("[ERROR]"));

    server.stop().await;
}

#[tokio::test]
async fn env_vars_are_injected_into_local_runs() {
    let server = spawn_server().await;
    let env = server
        .state
        .create_env_var("GREETING", "hi-from-env", "test value")
        .await
        .expect("env var should be created");

    let mut new_task = shell_task("env-echo", "printf '%s' \"$GREETING\"", "0 0 0 1 1 *");
    new_task.envs = env.id.to_string();
    let task = server
        .state
        .create_task(new_task)
        .await
        .expect("task should be created");

    server
        .state
        .run_task_now(task.id)
        .await
        .expect("trigger should succeed");

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(
        decompress_output(&logs[0].output).expect("output should decompress"),
        "hi-from-env"
    );

    server.stop().await;
}

#[tokio::test]
async fn dispatch_reload_keeps_firing() {
    use baihu::application::config::DispatchSettings;

    let server = spawn_server().await;
    server
        .state
        .reload_dispatch(DispatchSettings {
            worker_count: 1,
            queue_size: 4,
            rate_interval_ms: 5,
        })
        .await;
    assert_eq!(server.state.dispatch_settings().await.worker_count, 1);

    let task = server
        .state
        .create_task(shell_task("survivor", "echo alive", "* * * * * *"))
        .await
        .expect("task should be created");

    let logs = wait_for_logs(&server.state, task.id, 1).await;
    assert_eq!(logs[0].status, ExecStatus::Success);

    server.stop().await;
}

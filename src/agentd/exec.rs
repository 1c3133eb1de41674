use std::path::Path;

use crate::{
    application::executor::{self, run_shell},
    domain::models::{AgentTaskView, TaskResultReport},
    storage::now_unix_ms,
};

/// Runs one pushed task on this node. Same contract as the server-side
/// executor; the working directory is used as given and empty means the
/// process cwd. Env-var ids are a server-side concern and are not resolved
/// here.
pub async fn execute_task(task: &AgentTaskView) -> TaskResultReport {
    tracing::info!("executing task #{} {}", task.id, task.name);

    let started_at_ms = now_unix_ms();
    let work_dir = task.work_dir.trim();
    let work_dir = if work_dir.is_empty() {
        None
    } else {
        Some(Path::new(work_dir))
    };

    let outcome = run_shell(
        &task.command,
        work_dir,
        &[],
        executor::effective_timeout(task.timeout),
    )
    .await;
    let ended_at_ms = now_unix_ms();

    tracing::info!(
        "task #{} finished ({})",
        task.id,
        outcome.status.as_str()
    );

    TaskResultReport {
        task_id: task.id,
        command: task.command.clone(),
        output: outcome.output,
        status: outcome.status,
        duration: ended_at_ms.saturating_sub(started_at_ms),
        exit_code: outcome.exit_code,
        start_time: started_at_ms / 1_000,
        end_time: ended_at_ms / 1_000,
    }
}

#[cfg(test)]
mod tests {
    use super::execute_task;
    use crate::domain::models::{AgentTaskView, ExecStatus};

    fn view(command: &str) -> AgentTaskView {
        AgentTaskView {
            id: 7,
            name: "probe".to_owned(),
            command: command.to_owned(),
            schedule: "0 * * * * *".to_owned(),
            timeout: 1,
            work_dir: String::new(),
            envs: String::new(),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn result_report_carries_the_contract_fields() {
        let report = execute_task(&view("echo remote")).await;
        assert_eq!(report.task_id, 7);
        assert_eq!(report.status, ExecStatus::Success);
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.output, "remote\n");
        assert!(report.duration >= 0);
        assert!(report.end_time >= report.start_time);
    }

    #[tokio::test]
    async fn failure_is_reported_with_error_footer() {
        let report = execute_task(&view("exit 9")).await;
        assert_eq!(report.status, ExecStatus::Failed);
        assert_eq!(report.exit_code, 9);
        assert!(report.output.contains("[ERROR]"));
    }
}

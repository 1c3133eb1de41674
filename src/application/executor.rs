use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use tokio::{io::AsyncReadExt, process::Command, time::timeout};

use crate::{
    application::state::SharedState,
    domain::models::{ExecStatus, ExecutionResult, TaskRecord},
    storage::now_unix_ms,
};

pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

/// Raw outcome of one shell invocation, before task bookkeeping.
#[derive(Debug, Clone)]
pub struct ShellOutcome {
    pub output: String,
    pub status: ExecStatus,
    pub exit_code: i64,
    pub timed_out: bool,
}

/// Runs a task on this host and returns the result for the log pipeline.
pub async fn execute_local(state: &SharedState, task: &TaskRecord) -> ExecutionResult {
    let started_at_ms = now_unix_ms();

    if state.config().demo_mode {
        let ended_at_ms = now_unix_ms();
        return ExecutionResult {
            task_id: task.id,
            agent_id: None,
            command: task.command.clone(),
            output: format!(
                "[demo] task #{} ({}) skipped, command not executed: {}",
                task.id, task.name, task.command
            ),
            status: ExecStatus::Success,
            duration_ms: ended_at_ms.saturating_sub(started_at_ms),
            exit_code: 0,
            started_at_ms,
            ended_at_ms,
        };
    }

    let env_pairs = match state.store().env_pairs_by_ids(&task.envs).await {
        Ok(pairs) => pairs,
        Err(error) => {
            tracing::warn!("task #{} env lookup failed: {error}", task.id);
            Vec::new()
        }
    };

    let work_dir = resolve_work_dir(&state.config().scripts_dir, &task.work_dir);
    let outcome = run_shell(
        &task.command,
        Some(&work_dir),
        &env_pairs,
        effective_timeout(task.timeout),
    )
    .await;

    let ended_at_ms = now_unix_ms();
    ExecutionResult {
        task_id: task.id,
        agent_id: None,
        command: task.command.clone(),
        output: outcome.output,
        status: outcome.status,
        duration_ms: ended_at_ms.saturating_sub(started_at_ms),
        exit_code: outcome.exit_code,
        started_at_ms,
        ended_at_ms,
    }
}

/// Empty ⇒ the scripts base dir, relative ⇒ under it, absolute ⇒ as-is.
#[must_use]
pub fn resolve_work_dir(scripts_dir: &Path, work_dir: &str) -> PathBuf {
    let trimmed = work_dir.trim();
    if trimmed.is_empty() {
        return scripts_dir.to_path_buf();
    }
    let path = Path::new(trimmed);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        scripts_dir.join(path)
    }
}

#[must_use]
pub fn effective_timeout(timeout_minutes: i64) -> Duration {
    let minutes = if timeout_minutes <= 0 {
        DEFAULT_TIMEOUT_MINUTES
    } else {
        timeout_minutes
    };
    Duration::from_secs(u64::try_from(minutes).unwrap_or(DEFAULT_TIMEOUT_MINUTES as u64) * 60)
}

/// Spawns `sh -c` (or `cmd /c`), inherits the process environment plus the
/// given pairs, captures stdout and stderr, and enforces the deadline with
/// a process-group kill. Never panics; every failure mode folds into the
/// outcome with the `[ERROR]` footer contract.
pub async fn run_shell(
    command: &str,
    work_dir: Option<&Path>,
    env_pairs: &[String],
    deadline: Duration,
) -> ShellOutcome {
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    if let Some(dir) = work_dir {
        cmd.current_dir(dir);
    }
    for pair in env_pairs {
        if let Some((name, value)) = pair.split_once('=') {
            cmd.env(name, value);
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ShellOutcome {
                output: format!("[ERROR] failed to spawn command: {error}"),
                status: ExecStatus::Failed,
                exit_code: 1,
                timed_out: false,
            };
        }
    };

    let pid = child.id();
    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let waited = {
        let drain = async {
            let read_out = async {
                if let Some(pipe) = stdout_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stdout_buf).await;
                }
            };
            let read_err = async {
                if let Some(pipe) = stderr_pipe.as_mut() {
                    let _ = pipe.read_to_end(&mut stderr_buf).await;
                }
            };
            tokio::join!(read_out, read_err);
        };
        let wait = child.wait();
        timeout(deadline, async {
            let (status, ()) = tokio::join!(wait, drain);
            status
        })
        .await
    };

    let stdout_text = String::from_utf8_lossy(&stdout_buf).into_owned();
    let stderr_text = String::from_utf8_lossy(&stderr_buf).into_owned();

    match waited {
        Ok(Ok(status)) if status.success() => ShellOutcome {
            output: stdout_text,
            status: ExecStatus::Success,
            exit_code: 0,
            timed_out: false,
        },
        Ok(Ok(status)) => {
            let exit_code = i64::from(status.code().unwrap_or(1));
            ShellOutcome {
                output: failure_output(&stdout_text, &stderr_text, &format!("exit status {exit_code}")),
                status: ExecStatus::Failed,
                exit_code,
                timed_out: false,
            }
        }
        Ok(Err(error)) => ShellOutcome {
            output: failure_output(&stdout_text, &stderr_text, &format!("wait failed: {error}")),
            status: ExecStatus::Failed,
            exit_code: 1,
            timed_out: false,
        },
        Err(_) => {
            kill_process_group(pid);
            let _ = child.start_kill();
            ShellOutcome {
                output: failure_output(&stdout_text, &stderr_text, "execution timed out"),
                status: ExecStatus::Failed,
                exit_code: -1,
                timed_out: true,
            }
        }
    }
}

fn shell_command(command: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c").arg(command);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

fn failure_output(stdout: &str, stderr: &str, message: &str) -> String {
    format!("{stdout}\n[ERROR]\n{stderr}\n{message}")
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        if let Ok(raw) = i32::try_from(pid) {
            let group = nix::unistd::Pid::from_raw(-raw);
            let _ = nix::sys::signal::kill(group, nix::sys::signal::Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

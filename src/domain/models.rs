use serde::{Deserialize, Serialize};

/// Per-task rule for deleting old execution logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetentionPolicy {
    ByAge {
        #[serde(default)]
        keep_days: i64,
    },
    ByCount {
        #[serde(default)]
        keep_last: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    /// May be empty for agent-bound tasks interpreted remotely.
    pub command: String,
    pub schedule: String,
    /// Minutes; values <= 0 fall back to the 30-minute default at run time.
    pub timeout: i64,
    pub work_dir: String,
    /// Comma-separated env-var ids.
    pub envs: String,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub agent_id: Option<i64>,
    pub enabled: bool,
    pub last_run_ms: Option<i64>,
    pub next_run_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Fields accepted when creating a task. Id and timestamps are assigned by
/// the store.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub name: String,
    #[serde(default)]
    pub command: String,
    pub schedule: String,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(default)]
    pub work_dir: String,
    #[serde(default)]
    pub envs: String,
    #[serde(default)]
    pub retention: Option<RetentionPolicy>,
    #[serde(default)]
    pub agent_id: Option<i64>,
}

const fn default_timeout() -> i64 {
    30
}

#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub command: Option<String>,
    pub schedule: Option<String>,
    pub timeout: Option<i64>,
    pub work_dir: Option<String>,
    pub envs: Option<String>,
    pub retention: Option<Option<RetentionPolicy>>,
    pub agent_id: Option<Option<i64>>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVarRecord {
    pub id: i64,
    pub name: String,
    pub value: String,
    pub remark: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Success,
    Failed,
}

impl ExecStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// Immutable record of one execution. `output` holds raw gzip bytes and is
/// not serialized.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogRecord {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: Option<i64>,
    pub command: String,
    #[serde(skip)]
    pub output: Vec<u8>,
    pub status: ExecStatus,
    pub duration_ms: i64,
    pub exit_code: i64,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
    pub created_at_ms: i64,
}

/// Outcome of one local or remote execution, before it enters the log
/// pipeline.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub task_id: i64,
    pub agent_id: Option<i64>,
    pub command: String,
    pub output: String,
    pub status: ExecStatus,
    pub duration_ms: i64,
    pub exit_code: i64,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub token: String,
    pub machine_id: String,
    pub ip: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
    pub build_time: String,
    pub status: String,
    pub last_seen_ms: Option<i64>,
    pub enabled: bool,
    pub force_update: bool,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollTokenRecord {
    pub id: i64,
    pub token: String,
    pub remark: String,
    /// 0 means unlimited.
    pub max_uses: i64,
    pub used_count: i64,
    pub expires_at_ms: Option<i64>,
    pub enabled: bool,
    pub created_at_ms: i64,
}

/// Task element pushed to agents in `tasks` frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentTaskView {
    pub id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub timeout: i64,
    pub work_dir: String,
    pub envs: String,
    pub enabled: bool,
}

impl AgentTaskView {
    #[must_use]
    pub fn from_task(task: &TaskRecord) -> Self {
        Self {
            id: task.id,
            name: task.name.clone(),
            command: task.command.clone(),
            schedule: task.schedule.clone(),
            timeout: task.timeout,
            work_dir: task.work_dir.clone(),
            envs: task.envs.clone(),
            enabled: task.enabled,
        }
    }
}

/// `task_result` wire body. Start/end are unix seconds on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: i64,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub output: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: i64,
}

impl TaskResultReport {
    #[must_use]
    pub fn into_execution_result(self, agent_id: i64) -> ExecutionResult {
        ExecutionResult {
            task_id: self.task_id,
            agent_id: Some(agent_id),
            command: self.command,
            output: self.output,
            status: self.status,
            duration_ms: self.duration,
            exit_code: self.exit_code,
            started_at_ms: self.start_time.saturating_mul(1_000),
            ended_at_ms: self.end_time.saturating_mul(1_000),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyStatRecord {
    pub day: String,
    pub task_id: i64,
    pub status: String,
    pub count: i64,
}

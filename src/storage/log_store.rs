use crate::{
    domain::{
        error::DomainError,
        models::{ExecStatus, TaskLogRecord},
    },
    storage::{SqliteStore, util},
};

type LogRow = (
    i64,
    i64,
    Option<i64>,
    String,
    Vec<u8>,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
);

const LOG_COLUMNS: &str = "id, task_id, agent_id, command, output, status, duration_ms, \
     exit_code, started_at_ms, ended_at_ms, created_at_ms";

/// What gets written for one execution; id and created_at are assigned here.
#[derive(Debug, Clone)]
pub struct NewTaskLog {
    pub task_id: i64,
    pub agent_id: Option<i64>,
    pub command: String,
    pub output: Vec<u8>,
    pub status: ExecStatus,
    pub duration_ms: i64,
    pub exit_code: i64,
    pub started_at_ms: i64,
    pub ended_at_ms: i64,
}

impl SqliteStore {
    pub async fn insert_task_log(&self, log: &NewTaskLog) -> Result<i64, DomainError> {
        let id = sqlx::query(
            "INSERT INTO task_logs(task_id, agent_id, command, output, status, duration_ms, exit_code, started_at_ms, ended_at_ms, created_at_ms) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(log.task_id)
        .bind(log.agent_id)
        .bind(&log.command)
        .bind(&log.output)
        .bind(log.status.as_str())
        .bind(log.duration_ms)
        .bind(log.exit_code)
        .bind(log.started_at_ms)
        .bind(log.ended_at_ms)
        .bind(util::now_unix_ms())
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to insert task log: {error}")))?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_task_log(&self, id: i64) -> Result<Option<TaskLogRecord>, DomainError> {
        let row = sqlx::query_as::<_, LogRow>(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE id = ? LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get task log: {error}")))?;

        row.map(map_log_row).transpose()
    }

    pub async fn list_task_logs(
        &self,
        task_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<TaskLogRecord>, DomainError> {
        let limit = i64::try_from(limit.unwrap_or(100)).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, LogRow>(&format!(
            "SELECT {LOG_COLUMNS} FROM task_logs WHERE task_id = ? ORDER BY id DESC LIMIT ?"
        ))
        .bind(task_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list task logs: {error}")))?;

        rows.into_iter().map(map_log_row).collect()
    }

    pub async fn count_task_logs(&self, task_id: i64) -> Result<i64, DomainError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM task_logs WHERE task_id = ?")
            .bind(task_id)
            .fetch_one(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to count task logs: {error}")))
    }

    pub async fn delete_task_logs_before(
        &self,
        task_id: i64,
        cutoff_ms: i64,
    ) -> Result<u64, DomainError> {
        let result = sqlx::query("DELETE FROM task_logs WHERE task_id = ? AND created_at_ms < ?")
            .bind(task_id)
            .bind(cutoff_ms)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to age out logs: {error}")))?;
        Ok(result.rows_affected())
    }

    /// Keeps the `keep_last` most recent logs for a task by deleting every
    /// row with an id below the boundary (the k-th most recent log).
    pub async fn delete_task_logs_beyond(
        &self,
        task_id: i64,
        keep_last: i64,
    ) -> Result<u64, DomainError> {
        if keep_last <= 0 {
            return Ok(0);
        }

        let boundary = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM task_logs WHERE task_id = ? ORDER BY id DESC LIMIT 1 OFFSET ?",
        )
        .bind(task_id)
        .bind(keep_last - 1)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to find log boundary: {error}")))?;

        let Some(boundary) = boundary else {
            return Ok(0);
        };

        let result = sqlx::query("DELETE FROM task_logs WHERE task_id = ? AND id < ?")
            .bind(task_id)
            .bind(boundary)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to trim logs: {error}")))?;
        Ok(result.rows_affected())
    }
}

fn map_log_row(row: LogRow) -> Result<TaskLogRecord, DomainError> {
    let (
        id,
        task_id,
        agent_id,
        command,
        output,
        status,
        duration_ms,
        exit_code,
        started_at_ms,
        ended_at_ms,
        created_at_ms,
    ) = row;

    let status = match status.as_str() {
        "success" => ExecStatus::Success,
        "failed" => ExecStatus::Failed,
        other => {
            return Err(DomainError::Storage(format!(
                "unknown task log status: {other}"
            )));
        }
    };

    Ok(TaskLogRecord {
        id,
        task_id,
        agent_id,
        command,
        output,
        status,
        duration_ms,
        exit_code,
        started_at_ms,
        ended_at_ms,
        created_at_ms,
    })
}

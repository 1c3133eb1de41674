use crate::{
    domain::{
        error::DomainError,
        models::{NewTask, RetentionPolicy, TaskPatch, TaskRecord},
    },
    storage::{SqliteStore, util},
};

type TaskRow = (
    i64,
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
    Option<i64>,
    i64,
    Option<i64>,
    Option<i64>,
    i64,
    i64,
);

const TASK_COLUMNS: &str = "id, name, command, schedule, timeout, work_dir, envs, retention_json, \
     agent_id, enabled, last_run_ms, next_run_ms, created_at_ms, updated_at_ms";

impl SqliteStore {
    pub async fn insert_task(&self, task: &NewTask) -> Result<TaskRecord, DomainError> {
        let now = util::now_unix_ms();
        let retention_json = encode_retention(task.retention.as_ref())?;

        let id = sqlx::query(
            "INSERT INTO tasks(name, command, schedule, timeout, work_dir, envs, retention_json, agent_id, enabled, created_at_ms, updated_at_ms) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&task.name)
        .bind(&task.command)
        .bind(&task.schedule)
        .bind(task.timeout)
        .bind(&task.work_dir)
        .bind(&task.envs)
        .bind(retention_json)
        .bind(task.agent_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to insert task: {error}")))?
        .last_insert_rowid();

        self.get_task(id)
            .await?
            .ok_or_else(|| DomainError::Storage("inserted task not readable".to_owned()))
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, DomainError> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get task: {error}")))?;

        row.map(map_task_row).transpose()
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DomainError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list tasks: {error}")))?;

        rows.into_iter().map(map_task_row).collect()
    }

    pub async fn list_enabled_tasks(&self) -> Result<Vec<TaskRecord>, DomainError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE enabled = 1 ORDER BY id ASC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list enabled tasks: {error}")))?;

        rows.into_iter().map(map_task_row).collect()
    }

    pub async fn list_tasks_paged(
        &self,
        page: usize,
        page_size: usize,
        name_filter: Option<&str>,
    ) -> Result<(Vec<TaskRecord>, i64), DomainError> {
        let page = page.max(1);
        let page_size = page_size.clamp(1, 500);
        let pattern = name_filter.map(|name| format!("%{name}%"));

        let total = if let Some(pattern) = pattern.as_ref() {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks WHERE name LIKE ?")
                .bind(pattern)
                .fetch_one(self.pool())
                .await
        } else {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks")
                .fetch_one(self.pool())
                .await
        }
        .map_err(|error| DomainError::Storage(format!("failed to count tasks: {error}")))?;

        let offset = i64::try_from((page - 1) * page_size).unwrap_or(i64::MAX);
        let limit = i64::try_from(page_size).unwrap_or(i64::MAX);

        let rows = if let Some(pattern) = pattern.as_ref() {
            sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE name LIKE ? ORDER BY id DESC LIMIT ? OFFSET ?"
            ))
            .bind(pattern)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await
        } else {
            sqlx::query_as::<_, TaskRow>(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY id DESC LIMIT ? OFFSET ?"
            ))
            .bind(limit)
            .bind(offset)
            .fetch_all(self.pool())
            .await
        }
        .map_err(|error| DomainError::Storage(format!("failed to page tasks: {error}")))?;

        let tasks = rows
            .into_iter()
            .map(map_task_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((tasks, total))
    }

    pub async fn list_agent_tasks(&self, agent_id: i64) -> Result<Vec<TaskRecord>, DomainError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE agent_id = ? AND enabled = 1 ORDER BY id ASC"
        ))
        .bind(agent_id)
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list agent tasks: {error}")))?;

        rows.into_iter().map(map_task_row).collect()
    }

    pub async fn count_agent_tasks(&self, agent_id: i64) -> Result<i64, DomainError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM tasks WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_one(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to count agent tasks: {error}")))
    }

    pub async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<TaskRecord, DomainError> {
        let Some(mut existing) = self.get_task(id).await? else {
            return Err(DomainError::NotFound(format!("task not found: {id}")));
        };

        if let Some(name) = patch.name {
            existing.name = name;
        }
        if let Some(command) = patch.command {
            existing.command = command;
        }
        if let Some(schedule) = patch.schedule {
            existing.schedule = schedule;
        }
        if let Some(timeout) = patch.timeout {
            existing.timeout = timeout;
        }
        if let Some(work_dir) = patch.work_dir {
            existing.work_dir = work_dir;
        }
        if let Some(envs) = patch.envs {
            existing.envs = envs;
        }
        if let Some(retention) = patch.retention {
            existing.retention = retention;
        }
        if let Some(agent_id) = patch.agent_id {
            existing.agent_id = agent_id;
        }
        if let Some(enabled) = patch.enabled {
            existing.enabled = enabled;
        }
        existing.updated_at_ms = util::now_unix_ms();

        let retention_json = encode_retention(existing.retention.as_ref())?;
        sqlx::query(
            "UPDATE tasks SET name = ?, command = ?, schedule = ?, timeout = ?, work_dir = ?, \
             envs = ?, retention_json = ?, agent_id = ?, enabled = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(&existing.name)
        .bind(&existing.command)
        .bind(&existing.schedule)
        .bind(existing.timeout)
        .bind(&existing.work_dir)
        .bind(&existing.envs)
        .bind(retention_json)
        .bind(existing.agent_id)
        .bind(i64::from(existing.enabled))
        .bind(existing.updated_at_ms)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to update task: {error}")))?;

        Ok(existing)
    }

    pub async fn remove_task(&self, id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to remove task: {error}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_task_next_run(
        &self,
        id: i64,
        next_run_ms: Option<i64>,
    ) -> Result<(), DomainError> {
        sqlx::query("UPDATE tasks SET next_run_ms = ? WHERE id = ?")
            .bind(next_run_ms)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to set next run: {error}")))?;
        Ok(())
    }

    pub async fn set_task_last_run(&self, id: i64, last_run_ms: i64) -> Result<(), DomainError> {
        sqlx::query("UPDATE tasks SET last_run_ms = ? WHERE id = ?")
            .bind(last_run_ms)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to set last run: {error}")))?;
        Ok(())
    }
}

fn encode_retention(retention: Option<&RetentionPolicy>) -> Result<Option<String>, DomainError> {
    retention
        .map(|policy| util::to_json_text(policy).map_err(DomainError::Storage))
        .transpose()
}

fn map_task_row(row: TaskRow) -> Result<TaskRecord, DomainError> {
    let (
        id,
        name,
        command,
        schedule,
        timeout,
        work_dir,
        envs,
        retention_json,
        agent_id,
        enabled,
        last_run_ms,
        next_run_ms,
        created_at_ms,
        updated_at_ms,
    ) = row;

    let retention = retention_json
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .map(util::from_json_text::<RetentionPolicy>)
        .transpose()
        .map_err(DomainError::Storage)?;

    Ok(TaskRecord {
        id,
        name,
        command,
        schedule,
        timeout,
        work_dir,
        envs,
        retention,
        agent_id,
        enabled: enabled == 1,
        last_run_ms,
        next_run_ms,
        created_at_ms,
        updated_at_ms,
    })
}

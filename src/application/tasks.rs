use crate::{
    application::{clock, dispatch, executor, pipeline, state::SharedState},
    domain::{
        error::DomainError,
        models::{EnvVarRecord, ExecutionResult, NewTask, TaskLogRecord, TaskPatch, TaskRecord},
    },
};

impl SharedState {
    // ===== task catalog =====

    /// Admits a task: schedule validated up front, entry scheduled, bound
    /// agent notified.
    pub async fn create_task(&self, new_task: NewTask) -> Result<TaskRecord, DomainError> {
        clock::validate_schedule(&new_task.schedule)?;

        let task = self.store().insert_task(&new_task).await?;
        self.registry().add_or_update(self, &task).await?;
        if let Some(agent_id) = task.agent_id {
            self.push_tasks_to_agent(agent_id).await?;
        }
        tracing::info!("task #{} created: {}", task.id, task.name);
        Ok(task)
    }

    /// Applies a patch and re-syncs scheduling. When the binding moves
    /// between agents both sides get a fresh task set.
    pub async fn update_task(&self, id: i64, patch: TaskPatch) -> Result<TaskRecord, DomainError> {
        if let Some(schedule) = patch.schedule.as_deref() {
            clock::validate_schedule(schedule)?;
        }

        let before = self
            .store()
            .get_task(id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("task not found: {id}")))?;
        let task = self.store().update_task(id, patch).await?;

        self.registry().add_or_update(self, &task).await?;

        if before.agent_id != task.agent_id {
            if let Some(old_agent) = before.agent_id {
                self.push_tasks_to_agent(old_agent).await?;
            }
        }
        if let Some(agent_id) = task.agent_id {
            self.push_tasks_to_agent(agent_id).await?;
        }
        Ok(task)
    }

    pub async fn delete_task(&self, id: i64) -> Result<bool, DomainError> {
        let existing = self.store().get_task(id).await?;
        let removed = self.store().remove_task(id).await?;
        if removed {
            self.registry().remove(id);
            if let Some(agent_id) = existing.and_then(|task| task.agent_id) {
                self.push_tasks_to_agent(agent_id).await?;
            }
            tracing::info!("task #{id} deleted");
        }
        Ok(removed)
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, DomainError> {
        self.store().get_task(id).await
    }

    pub async fn list_tasks(&self) -> Result<Vec<TaskRecord>, DomainError> {
        self.store().list_tasks().await
    }

    pub async fn list_tasks_paged(
        &self,
        page: usize,
        page_size: usize,
        name_filter: Option<&str>,
    ) -> Result<(Vec<TaskRecord>, i64), DomainError> {
        self.store()
            .list_tasks_paged(page, page_size, name_filter)
            .await
    }

    /// Manual trigger. Local tasks execute inline and the log record exists
    /// when this returns; agent-bound tasks get an `execute` push and the
    /// result arrives later as a `task_result` frame.
    pub async fn run_task_now(&self, id: i64) -> Result<Option<ExecutionResult>, DomainError> {
        let task = self
            .store()
            .get_task(id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("task not found: {id}")))?;

        if let Some(agent_id) = task.agent_id {
            dispatch::push_execute(self, task.id, agent_id).await;
            return Ok(None);
        }

        let result = executor::execute_local(self, &task).await;
        pipeline::process_result(self, result.clone()).await?;
        Ok(Some(result))
    }

    pub async fn task_logs(
        &self,
        task_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<TaskLogRecord>, DomainError> {
        self.store().list_task_logs(task_id, limit).await
    }

    pub async fn get_task_log(&self, id: i64) -> Result<Option<TaskLogRecord>, DomainError> {
        self.store().get_task_log(id).await
    }

    // ===== environment variables =====

    pub async fn create_env_var(
        &self,
        name: &str,
        value: &str,
        remark: &str,
    ) -> Result<EnvVarRecord, DomainError> {
        if name.trim().is_empty() {
            return Err(DomainError::InvalidRequest("env name is required".to_owned()));
        }
        self.store().insert_env_var(name.trim(), value, remark).await
    }

    pub async fn update_env_var(
        &self,
        id: i64,
        name: &str,
        value: &str,
        remark: &str,
    ) -> Result<(), DomainError> {
        self.store().update_env_var(id, name, value, remark).await
    }

    pub async fn delete_env_var(&self, id: i64) -> Result<bool, DomainError> {
        self.store().remove_env_var(id).await
    }

    pub async fn list_env_vars(&self) -> Result<Vec<EnvVarRecord>, DomainError> {
        self.store().list_env_vars().await
    }
}

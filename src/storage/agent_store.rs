use crate::{
    domain::{error::DomainError, models::AgentRecord},
    storage::{SqliteStore, util},
};

type AgentRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<i64>,
    i64,
    i64,
    i64,
);

const AGENT_COLUMNS: &str = "id, name, description, token, machine_id, ip, hostname, os, arch, \
     version, build_time, status, last_seen_ms, enabled, force_update, created_at_ms";

/// Heartbeat payload merged into an agent row; empty strings leave the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct AgentFacts {
    pub ip: String,
    pub version: String,
    pub build_time: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
}

impl SqliteStore {
    pub async fn insert_agent(
        &self,
        name: &str,
        token: &str,
        machine_id: &str,
        ip: &str,
    ) -> Result<AgentRecord, DomainError> {
        let now = util::now_unix_ms();
        let id = sqlx::query(
            "INSERT INTO agents(name, token, machine_id, ip, status, last_seen_ms, enabled, created_at_ms) \
             VALUES(?, ?, ?, ?, 'online', ?, 1, ?)",
        )
        .bind(name)
        .bind(token)
        .bind(machine_id)
        .bind(ip)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to insert agent: {error}")))?
        .last_insert_rowid();

        self.get_agent(id)
            .await?
            .ok_or_else(|| DomainError::Storage("inserted agent not readable".to_owned()))
    }

    pub async fn get_agent(&self, id: i64) -> Result<Option<AgentRecord>, DomainError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE id = ? LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get agent: {error}")))?;

        Ok(row.map(map_agent_row))
    }

    pub async fn get_agent_by_token(&self, token: &str) -> Result<Option<AgentRecord>, DomainError> {
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE token = ? LIMIT 1"
        ))
        .bind(token)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to get agent by token: {error}")))?;

        Ok(row.map(map_agent_row))
    }

    pub async fn get_agent_by_machine_id(
        &self,
        machine_id: &str,
    ) -> Result<Option<AgentRecord>, DomainError> {
        if machine_id.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE machine_id = ? LIMIT 1"
        ))
        .bind(machine_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|error| {
            DomainError::Storage(format!("failed to get agent by machine id: {error}"))
        })?;

        Ok(row.map(map_agent_row))
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>, DomainError> {
        let rows = sqlx::query_as::<_, AgentRow>(&format!(
            "SELECT {AGENT_COLUMNS} FROM agents ORDER BY id DESC"
        ))
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list agents: {error}")))?;

        Ok(rows.into_iter().map(map_agent_row).collect())
    }

    /// Re-binds an existing agent row on machine-id reuse.
    pub async fn rebind_agent(
        &self,
        id: i64,
        token: &str,
        ip: &str,
    ) -> Result<(), DomainError> {
        sqlx::query(
            "UPDATE agents SET token = ?, ip = ?, status = 'online', last_seen_ms = ? WHERE id = ?",
        )
        .bind(token)
        .bind(ip)
        .bind(util::now_unix_ms())
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to rebind agent: {error}")))?;
        Ok(())
    }

    pub async fn touch_agent(&self, id: i64, facts: &AgentFacts) -> Result<(), DomainError> {
        sqlx::query(
            "UPDATE agents SET status = 'online', last_seen_ms = ?, \
             ip = CASE WHEN ? != '' THEN ? ELSE ip END, \
             version = CASE WHEN ? != '' THEN ? ELSE version END, \
             build_time = CASE WHEN ? != '' THEN ? ELSE build_time END, \
             hostname = CASE WHEN ? != '' THEN ? ELSE hostname END, \
             os = CASE WHEN ? != '' THEN ? ELSE os END, \
             arch = CASE WHEN ? != '' THEN ? ELSE arch END \
             WHERE id = ?",
        )
        .bind(util::now_unix_ms())
        .bind(&facts.ip)
        .bind(&facts.ip)
        .bind(&facts.version)
        .bind(&facts.version)
        .bind(&facts.build_time)
        .bind(&facts.build_time)
        .bind(&facts.hostname)
        .bind(&facts.hostname)
        .bind(&facts.os)
        .bind(&facts.os)
        .bind(&facts.arch)
        .bind(&facts.arch)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to touch agent: {error}")))?;
        Ok(())
    }

    pub async fn update_agent_meta(
        &self,
        id: i64,
        name: &str,
        description: &str,
        enabled: bool,
    ) -> Result<(), DomainError> {
        let result =
            sqlx::query("UPDATE agents SET name = ?, description = ?, enabled = ? WHERE id = ?")
                .bind(name)
                .bind(description)
                .bind(i64::from(enabled))
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(|error| {
                    DomainError::Storage(format!("failed to update agent: {error}"))
                })?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!("agent not found: {id}")));
        }
        Ok(())
    }

    pub async fn remove_agent(&self, id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to remove agent: {error}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_agent_status(&self, id: i64, status: &str) -> Result<(), DomainError> {
        sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to set agent status: {error}")))?;
        Ok(())
    }

    pub async fn sweep_offline_agents(&self, cutoff_ms: i64) -> Result<u64, DomainError> {
        let result = sqlx::query(
            "UPDATE agents SET status = 'offline' WHERE status = 'online' AND \
             (last_seen_ms IS NULL OR last_seen_ms < ?)",
        )
        .bind(cutoff_ms)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to sweep agents: {error}")))?;
        Ok(result.rows_affected())
    }

    pub async fn set_agent_force_update(&self, id: i64, flag: bool) -> Result<(), DomainError> {
        let result = sqlx::query("UPDATE agents SET force_update = ? WHERE id = ?")
            .bind(i64::from(flag))
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to set force update: {error}")))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!("agent not found: {id}")));
        }
        Ok(())
    }

    /// Returns whether the flag was set, clearing it in the same statement.
    pub async fn take_agent_force_update(&self, id: i64) -> Result<bool, DomainError> {
        let result =
            sqlx::query("UPDATE agents SET force_update = 0 WHERE id = ? AND force_update = 1")
                .bind(id)
                .execute(self.pool())
                .await
                .map_err(|error| {
                    DomainError::Storage(format!("failed to take force update: {error}"))
                })?;
        Ok(result.rows_affected() > 0)
    }
}

fn map_agent_row(row: AgentRow) -> AgentRecord {
    let (
        id,
        name,
        description,
        token,
        machine_id,
        ip,
        hostname,
        os,
        arch,
        version,
        build_time,
        status,
        last_seen_ms,
        enabled,
        force_update,
        created_at_ms,
    ) = row;

    AgentRecord {
        id,
        name,
        description,
        token,
        machine_id,
        ip,
        hostname,
        os,
        arch,
        version,
        build_time,
        status,
        last_seen_ms,
        enabled: enabled == 1,
        force_update: force_update == 1,
        created_at_ms,
    }
}

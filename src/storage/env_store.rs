use crate::{
    domain::{error::DomainError, models::EnvVarRecord},
    storage::SqliteStore,
};

type EnvRow = (i64, String, String, String);

impl SqliteStore {
    pub async fn insert_env_var(
        &self,
        name: &str,
        value: &str,
        remark: &str,
    ) -> Result<EnvVarRecord, DomainError> {
        let id = sqlx::query("INSERT INTO env_vars(name, value, remark) VALUES(?, ?, ?)")
            .bind(name)
            .bind(value)
            .bind(remark)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to insert env var: {error}")))?
            .last_insert_rowid();

        Ok(EnvVarRecord {
            id,
            name: name.to_owned(),
            value: value.to_owned(),
            remark: remark.to_owned(),
        })
    }

    pub async fn update_env_var(
        &self,
        id: i64,
        name: &str,
        value: &str,
        remark: &str,
    ) -> Result<(), DomainError> {
        let result = sqlx::query("UPDATE env_vars SET name = ?, value = ?, remark = ? WHERE id = ?")
            .bind(name)
            .bind(value)
            .bind(remark)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to update env var: {error}")))?;

        if result.rows_affected() == 0 {
            return Err(DomainError::NotFound(format!("env var not found: {id}")));
        }
        Ok(())
    }

    pub async fn remove_env_var(&self, id: i64) -> Result<bool, DomainError> {
        let result = sqlx::query("DELETE FROM env_vars WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to remove env var: {error}")))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_env_vars(&self) -> Result<Vec<EnvVarRecord>, DomainError> {
        let rows = sqlx::query_as::<_, EnvRow>(
            "SELECT id, name, value, remark FROM env_vars ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list env vars: {error}")))?;

        Ok(rows.into_iter().map(map_env_row).collect())
    }

    /// Resolves a comma-separated id list into `NAME=VALUE` pairs. Ids that
    /// do not parse or no longer exist are skipped.
    pub async fn env_pairs_by_ids(&self, ids: &str) -> Result<Vec<String>, DomainError> {
        let parsed = ids
            .split(',')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect::<Vec<_>>();
        if parsed.is_empty() {
            return Ok(Vec::new());
        }

        let mut pairs = Vec::with_capacity(parsed.len());
        for id in parsed {
            let row = sqlx::query_as::<_, EnvRow>(
                "SELECT id, name, value, remark FROM env_vars WHERE id = ? LIMIT 1",
            )
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|error| DomainError::Storage(format!("failed to get env var: {error}")))?;

            if let Some(row) = row {
                let env = map_env_row(row);
                pairs.push(format!("{}={}", env.name, env.value));
            }
        }
        Ok(pairs)
    }
}

fn map_env_row(row: EnvRow) -> EnvVarRecord {
    let (id, name, value, remark) = row;
    EnvVarRecord {
        id,
        name,
        value,
        remark,
    }
}

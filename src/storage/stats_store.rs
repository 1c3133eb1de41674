use crate::{
    domain::{error::DomainError, models::DailyStatRecord},
    storage::SqliteStore,
};

type StatRow = (String, i64, String, i64);

impl SqliteStore {
    pub async fn increment_task_stat(
        &self,
        day: &str,
        task_id: i64,
        status: &str,
    ) -> Result<(), DomainError> {
        sqlx::query(
            "INSERT INTO task_stats(day, task_id, status, count) VALUES(?, ?, ?, 1) \
             ON CONFLICT(day, task_id, status) DO UPDATE SET count = count + 1",
        )
        .bind(day)
        .bind(task_id)
        .bind(status)
        .execute(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to bump task stat: {error}")))?;
        Ok(())
    }

    pub async fn list_task_stats(
        &self,
        since_day: &str,
    ) -> Result<Vec<DailyStatRecord>, DomainError> {
        let rows = sqlx::query_as::<_, StatRow>(
            "SELECT day, task_id, status, count FROM task_stats WHERE day >= ? \
             ORDER BY day ASC, task_id ASC",
        )
        .bind(since_day)
        .fetch_all(self.pool())
        .await
        .map_err(|error| DomainError::Storage(format!("failed to list task stats: {error}")))?;

        Ok(rows
            .into_iter()
            .map(|(day, task_id, status, count)| DailyStatRecord {
                day,
                task_id,
                status,
                count,
            })
            .collect())
    }
}

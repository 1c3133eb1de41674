use std::{path::Path, str::FromStr, time::Duration};

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};

use crate::domain::error::DomainError;

/// Dispatch workers, result-pipeline tasks, gateway pumps, and the
/// sweepers all write rows concurrently; a blocked writer should queue
/// behind the lock, not surface SQLITE_BUSY into a log record.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Row traffic is small (one log per execution, heartbeat touches); a
/// handful of connections is plenty and keeps WAL checkpointing cheap.
const MAX_CONNECTIONS: u32 = 8;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the task database and applies the
    /// schema. WAL with relaxed fsync is the concurrency mode this
    /// workload wants: readers never block the single writer.
    pub async fn connect(path: &Path) -> Result<Self, DomainError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|error| {
                DomainError::Storage(format!("failed to create parent directory: {error}"))
            })?;
        }

        let db_url = format!("sqlite://{}", path.display());
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(|error| DomainError::Storage(format!("invalid sqlite URL: {error}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|error| DomainError::Storage(format!("failed to connect sqlite: {error}")))?;

        let store = Self { pool };
        super::migrations::migrate(store.pool()).await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

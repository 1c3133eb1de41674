use sqlx::{Executor, SqlitePool};

use crate::domain::error::DomainError;

pub async fn migrate(pool: &SqlitePool) -> Result<(), DomainError> {
    let migration = r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        command TEXT NOT NULL DEFAULT '',
        schedule TEXT NOT NULL,
        timeout INTEGER NOT NULL DEFAULT 30,
        work_dir TEXT NOT NULL DEFAULT '',
        envs TEXT NOT NULL DEFAULT '',
        retention_json TEXT,
        agent_id INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run_ms INTEGER,
        next_run_ms INTEGER,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tasks_agent ON tasks(agent_id);

    CREATE TABLE IF NOT EXISTS env_vars (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        remark TEXT NOT NULL DEFAULT ''
    );

    CREATE TABLE IF NOT EXISTS task_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_id INTEGER NOT NULL,
        agent_id INTEGER,
        command TEXT NOT NULL DEFAULT '',
        output BLOB NOT NULL,
        status TEXT NOT NULL,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        exit_code INTEGER NOT NULL DEFAULT 0,
        started_at_ms INTEGER NOT NULL DEFAULT 0,
        ended_at_ms INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id, id DESC);

    CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        token TEXT NOT NULL,
        machine_id TEXT NOT NULL DEFAULT '',
        ip TEXT NOT NULL DEFAULT '',
        hostname TEXT NOT NULL DEFAULT '',
        os TEXT NOT NULL DEFAULT '',
        arch TEXT NOT NULL DEFAULT '',
        version TEXT NOT NULL DEFAULT '',
        build_time TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'offline',
        last_seen_ms INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        force_update INTEGER NOT NULL DEFAULT 0,
        created_at_ms INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_machine ON agents(machine_id) WHERE machine_id != '';
    CREATE INDEX IF NOT EXISTS idx_agents_token ON agents(token);

    CREATE TABLE IF NOT EXISTS enroll_tokens (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        token TEXT NOT NULL UNIQUE,
        remark TEXT NOT NULL DEFAULT '',
        max_uses INTEGER NOT NULL DEFAULT 0,
        used_count INTEGER NOT NULL DEFAULT 0,
        expires_at_ms INTEGER,
        enabled INTEGER NOT NULL DEFAULT 1,
        created_at_ms INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task_stats (
        day TEXT NOT NULL,
        task_id INTEGER NOT NULL,
        status TEXT NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (day, task_id, status)
    );
    "#;

    pool.execute(migration)
        .await
        .map_err(|error| DomainError::Storage(format!("migration failed: {error}")))?;

    Ok(())
}

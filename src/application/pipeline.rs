use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

use crate::{
    application::state::SharedState,
    domain::{
        error::DomainError,
        models::{ExecutionResult, RetentionPolicy},
    },
    storage::log_store::NewTaskLog,
};

/// Frees the worker immediately: the result is processed on its own task.
pub fn spawn_process(state: SharedState, result: ExecutionResult) {
    tokio::spawn(async move {
        let task_id = result.task_id;
        if let Err(error) = process_result(&state, result).await {
            tracing::error!("result pipeline failed for task #{task_id}: {error}");
        }
    });
}

/// The whole post-execution pipeline: compress → persist log → update
/// last-run → apply retention → bump daily stats. Returns the log row id.
pub async fn process_result(
    state: &SharedState,
    result: ExecutionResult,
) -> Result<i64, DomainError> {
    let compressed = match compress_output(&result.output) {
        Ok(bytes) => bytes,
        Err(error) => {
            tracing::warn!(
                "output compression failed for task #{}, storing empty body: {error}",
                result.task_id
            );
            Vec::new()
        }
    };

    let log_id = state
        .store()
        .insert_task_log(&NewTaskLog {
            task_id: result.task_id,
            agent_id: result.agent_id,
            command: result.command.clone(),
            output: compressed,
            status: result.status,
            duration_ms: result.duration_ms,
            exit_code: result.exit_code,
            started_at_ms: result.started_at_ms,
            ended_at_ms: result.ended_at_ms,
        })
        .await?;

    state
        .store()
        .set_task_last_run(result.task_id, result.ended_at_ms)
        .await?;

    if let Some(task) = state.store().get_task(result.task_id).await? {
        apply_retention(state, result.task_id, task.retention.as_ref()).await;
    }

    let day = state.clock().today();
    if let Err(error) = state
        .store()
        .increment_task_stat(&day, result.task_id, result.status.as_str())
        .await
    {
        tracing::warn!("stat bump failed for task #{}: {error}", result.task_id);
    }

    tracing::info!(
        "task #{} finished ({}) log #{log_id}",
        result.task_id,
        result.status.as_str()
    );
    Ok(log_id)
}

async fn apply_retention(state: &SharedState, task_id: i64, policy: Option<&RetentionPolicy>) {
    let deleted = match policy {
        None => return,
        Some(RetentionPolicy::ByAge { keep_days }) => {
            if *keep_days <= 0 {
                return;
            }
            let cutoff = crate::storage::now_unix_ms() - keep_days * 24 * 60 * 60 * 1_000;
            state.store().delete_task_logs_before(task_id, cutoff).await
        }
        Some(RetentionPolicy::ByCount { keep_last }) => {
            if *keep_last <= 0 {
                return;
            }
            state.store().delete_task_logs_beyond(task_id, *keep_last).await
        }
    };

    match deleted {
        Ok(count) if count > 0 => {
            tracing::info!("retention removed {count} logs for task #{task_id}");
        }
        Ok(_) => {}
        Err(error) => tracing::warn!("retention failed for task #{task_id}: {error}"),
    }
}

pub fn compress_output(output: &str) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(output.as_bytes())?;
    encoder.finish()
}

/// Inverse of `compress_output`; an empty body (compression failure marker)
/// decodes to an empty string.
pub fn decompress_output(bytes: &[u8]) -> Result<String, std::io::Error> {
    if bytes.is_empty() {
        return Ok(String::new());
    }
    let mut decoder = GzDecoder::new(bytes);
    let mut output = String::new();
    decoder.read_to_string(&mut output)?;
    Ok(output)
}

use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::{
    application::{clock::Clock, state::SharedState},
    domain::{error::DomainError, models::TaskRecord},
};

/// Exclusive owner of the in-memory cron entries. One timer task per
/// scheduled task id; a fire only enqueues a dispatch event, it never
/// executes inline.
pub struct SchedulerRegistry {
    clock: Clock,
    entries: Mutex<HashMap<i64, Entry>>,
}

struct Entry {
    fingerprint: u64,
    next_fire_ms: Arc<AtomicI64>,
    timer: JoinHandle<()>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

impl SchedulerRegistry {
    #[must_use]
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Brings the entry for `task` in line with the catalog. Unchanged
    /// `(schedule, command)` pairs are left alone; anything else replaces
    /// the old entry. Disabled, cron-invalid, and agent-bound tasks end up
    /// unscheduled here (agent-bound schedules live on the agent).
    /// Returns whether the task holds a live entry afterwards.
    pub async fn add_or_update(
        &self,
        state: &SharedState,
        task: &TaskRecord,
    ) -> Result<bool, DomainError> {
        if !task.enabled || task.agent_id.is_some() {
            self.remove(task.id);
            return Ok(false);
        }

        let fingerprint = fingerprint(&task.schedule, &task.command);
        {
            let entries = lock_entries(&self.entries);
            if entries
                .get(&task.id)
                .is_some_and(|entry| entry.fingerprint == fingerprint)
            {
                return Ok(true);
            }
        }

        // Parse before touching the map so an invalid edit surfaces without
        // tearing down the previous entry's replacement.
        let now = self.clock.now();
        let first_fire = self.clock.next_fire(&task.schedule, now)?;
        let next_fire_ms = Arc::new(AtomicI64::new(first_fire.timestamp_millis()));
        let _ = state
            .store()
            .set_task_next_run(task.id, Some(first_fire.timestamp_millis()))
            .await;

        let timer = tokio::spawn(timer_loop(
            state.clone(),
            self.clock,
            task.id,
            task.schedule.clone(),
            Arc::clone(&next_fire_ms),
        ));

        let mut entries = lock_entries(&self.entries);
        entries.insert(
            task.id,
            Entry {
                fingerprint,
                next_fire_ms,
                timer,
            },
        );
        Ok(true)
    }

    pub fn remove(&self, task_id: i64) {
        let mut entries = lock_entries(&self.entries);
        entries.remove(&task_id);
    }

    /// Snapshot of live entries: task id to next fire time (unix ms).
    #[must_use]
    pub fn list_active(&self) -> HashMap<i64, i64> {
        let entries = lock_entries(&self.entries);
        entries
            .iter()
            .map(|(id, entry)| (*id, entry.next_fire_ms.load(Ordering::Relaxed)))
            .collect()
    }

    #[must_use]
    pub fn is_scheduled(&self, task_id: i64) -> bool {
        lock_entries(&self.entries).contains_key(&task_id)
    }
}

fn lock_entries(
    entries: &Mutex<HashMap<i64, Entry>>,
) -> std::sync::MutexGuard<'_, HashMap<i64, Entry>> {
    match entries.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn fingerprint(schedule: &str, command: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    schedule.hash(&mut hasher);
    command.hash(&mut hasher);
    hasher.finish()
}

async fn timer_loop(
    state: SharedState,
    clock: Clock,
    task_id: i64,
    schedule: String,
    next_fire_ms: Arc<AtomicI64>,
) {
    loop {
        let now = clock.now();
        let next = match clock.next_fire(&schedule, now) {
            Ok(next) => next,
            Err(error) => {
                tracing::warn!("task #{task_id} timer stopped: {error}");
                return;
            }
        };
        next_fire_ms.store(next.timestamp_millis(), Ordering::Relaxed);
        if let Err(error) = state
            .store()
            .set_task_next_run(task_id, Some(next.timestamp_millis()))
            .await
        {
            tracing::warn!("task #{task_id} next-run persist failed: {error}");
        }

        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        state.enqueue_fire(task_id).await;
    }
}

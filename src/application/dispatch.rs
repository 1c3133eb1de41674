use std::sync::Arc;

use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::{Duration, Interval, MissedTickBehavior, interval},
};

use crate::{
    application::{config::DispatchSettings, executor, pipeline, state::SharedState},
    protocol,
};

#[derive(Debug, Clone, Copy)]
struct DispatchEvent {
    task_id: i64,
}

/// Fixed set of workers draining one bounded queue. The ticker is shared:
/// it caps the aggregate start rate at one task per interval, not one per
/// worker.
pub struct DispatchPool {
    settings: DispatchSettings,
    queue_tx: mpsc::Sender<DispatchEvent>,
    stop_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchPool {
    #[must_use]
    pub fn start(state: SharedState, settings: DispatchSettings) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(settings.queue_size);
        let (stop_tx, stop_rx) = watch::channel(false);

        let queue_rx = Arc::new(Mutex::new(queue_rx));
        let mut ticker = interval(Duration::from_millis(settings.rate_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let ticker = Arc::new(Mutex::new(ticker));

        let workers = (0..settings.worker_count)
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    state.clone(),
                    Arc::clone(&queue_rx),
                    Arc::clone(&ticker),
                    stop_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(
            "dispatch pool started: workers={} queue={} rate={}ms",
            settings.worker_count,
            settings.queue_size,
            settings.rate_interval_ms
        );

        Self {
            settings,
            queue_tx,
            stop_tx,
            workers,
        }
    }

    #[must_use]
    pub fn settings(&self) -> DispatchSettings {
        self.settings
    }

    /// Non-blocking enqueue; false means the queue is full (or tearing
    /// down) and the caller must fall back to direct execution.
    #[must_use]
    pub fn try_enqueue(&self, task_id: i64) -> bool {
        self.queue_tx.try_send(DispatchEvent { task_id }).is_ok()
    }

    /// Cooperative stop: signal, then wait for every worker to finish its
    /// current iteration. Child processes already running are not touched.
    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        tracing::info!("dispatch pool stopped");
    }
}

async fn worker_loop(
    index: usize,
    state: SharedState,
    queue_rx: Arc<Mutex<mpsc::Receiver<DispatchEvent>>>,
    ticker: Arc<Mutex<Interval>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    tracing::debug!("dispatch worker {index} up");
    loop {
        if *stop_rx.borrow() {
            break;
        }

        // Rate token first, then an event; the lock scopes keep both shared
        // resources usable by every worker.
        let got_token = {
            let mut ticker = ticker.lock().await;
            tokio::select! {
                _ = stop_rx.changed() => false,
                _ = ticker.tick() => true,
            }
        };
        if !got_token {
            break;
        }

        let event = {
            let mut queue = queue_rx.lock().await;
            tokio::select! {
                _ = stop_rx.changed() => None,
                event = queue.recv() => event,
            }
        };
        let Some(event) = event else {
            break;
        };

        run_dispatch(&state, event.task_id).await;
    }
    tracing::debug!("dispatch worker {index} down");
}

/// Routes one due-task event: local tasks through the executor and log
/// pipeline, agent-bound tasks as an `execute` push over the gateway.
/// Failures never propagate out of a scheduled fire.
pub async fn run_dispatch(state: &SharedState, task_id: i64) {
    let task = match state.store().get_task(task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            tracing::warn!("dispatch dropped: task #{task_id} no longer exists");
            return;
        }
        Err(error) => {
            tracing::warn!("dispatch dropped: task #{task_id} unreadable: {error}");
            return;
        }
    };

    if !task.enabled {
        tracing::debug!("dispatch skipped: task #{task_id} disabled");
        return;
    }

    if let Some(agent_id) = task.agent_id {
        push_execute(state, task_id, agent_id).await;
        return;
    }

    let result = executor::execute_local(state, &task).await;
    pipeline::spawn_process(state.clone(), result);
}

/// Remote leg of dispatch: the agent runs the task and reports back with a
/// `task_result` frame.
pub async fn push_execute(state: &SharedState, task_id: i64, agent_id: i64) {
    let agent = match state.store().get_agent(agent_id).await {
        Ok(Some(agent)) => agent,
        Ok(None) => {
            tracing::warn!("task #{task_id} bound to missing agent #{agent_id}");
            return;
        }
        Err(error) => {
            tracing::warn!("task #{task_id} agent lookup failed: {error}");
            return;
        }
    };

    if !agent.enabled {
        tracing::warn!("task #{task_id} not pushed: agent #{agent_id} disabled");
        return;
    }

    let frame = protocol::encode_frame(
        protocol::TYPE_EXECUTE,
        &serde_json::json!({ "task_id": task_id }),
    );
    if state.send_frame_to_agent(agent_id, frame).await {
        tracing::info!("task #{task_id} pushed to agent #{agent_id}");
    } else {
        tracing::warn!("task #{task_id} not delivered: agent #{agent_id} offline");
    }
}

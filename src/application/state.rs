use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
    time::Instant,
};

use serde_json::{Value, json};
use tokio::sync::{RwLock, mpsc, watch};

use crate::{
    application::{
        clock::Clock,
        config::{DispatchSettings, RuntimeConfig},
        dispatch::{self, DispatchPool},
        registry::SchedulerRegistry,
    },
    domain::{error::DomainError, models::AgentTaskView},
    protocol,
    security::rate_limit::ConnectRateLimiter,
    storage::{SqliteStore, now_unix_ms},
};

const OUTBOUND_BUFFER: usize = 256;

#[derive(Clone)]
pub struct SharedState {
    inner: Arc<InnerState>,
}

struct InnerState {
    config: RuntimeConfig,
    store: SqliteStore,
    started_at: Instant,
    limiter: ConnectRateLimiter,
    registry: SchedulerRegistry,
    dispatch: RwLock<Option<DispatchPool>>,
    connections: RwLock<HashMap<i64, AgentConnHandle>>,
    conn_seq: AtomicU64,
}

/// Opaque handle for one live agent connection. The write pump is the only
/// consumer of the outbound channel; everyone else enqueues through
/// `try_send`, which silently drops when the buffer is full.
#[derive(Debug, Clone)]
pub struct AgentConnHandle {
    pub agent_id: i64,
    pub conn_seq: u64,
    pub ip: String,
    outbound: mpsc::Sender<String>,
    last_ping_ms: Arc<AtomicI64>,
    close_tx: watch::Sender<bool>,
}

impl AgentConnHandle {
    pub fn try_send(&self, frame: String) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    pub fn touch_ping(&self) {
        self.last_ping_ms.store(now_unix_ms(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn last_ping_ms(&self) -> i64 {
        self.last_ping_ms.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        let _ = self.close_tx.send(true);
    }
}

/// What the gateway pumps need from a freshly registered connection.
pub struct AgentConnGuard {
    pub conn_seq: u64,
    pub outbound_rx: mpsc::Receiver<String>,
    pub close_rx: watch::Receiver<bool>,
}

impl SharedState {
    pub async fn new(config: RuntimeConfig) -> Result<Self, DomainError> {
        let store = SqliteStore::connect(&config.db_path).await?;
        let registry = SchedulerRegistry::new(config.clock);

        Ok(Self {
            inner: Arc::new(InnerState {
                store,
                started_at: Instant::now(),
                limiter: ConnectRateLimiter::new(),
                registry,
                dispatch: RwLock::new(None),
                connections: RwLock::new(HashMap::new()),
                conn_seq: AtomicU64::new(0),
                config,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.inner.config.clock
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.inner.store
    }

    #[must_use]
    pub fn limiter(&self) -> &ConnectRateLimiter {
        &self.inner.limiter
    }

    #[must_use]
    pub fn registry(&self) -> &SchedulerRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.inner.started_at.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Builds the worker pool and seeds the scheduler from every enabled
    /// task. Called once after construction.
    pub async fn start_runtime(&self) -> Result<(), DomainError> {
        {
            let mut guard = self.inner.dispatch.write().await;
            if guard.is_none() {
                *guard = Some(DispatchPool::start(self.clone(), self.config().dispatch));
            }
        }

        let tasks = self.store().list_enabled_tasks().await?;
        for task in tasks {
            if let Err(error) = self.inner.registry.add_or_update(self, &task).await {
                tracing::warn!("task #{} not scheduled: {error}", task.id);
            }
        }
        Ok(())
    }

    /// Tears the worker pool down cooperatively and rebuilds it with new
    /// settings. In-flight executions keep running.
    pub async fn reload_dispatch(&self, settings: DispatchSettings) {
        let old = self.inner.dispatch.write().await.take();
        if let Some(pool) = old {
            pool.shutdown().await;
        }
        let mut guard = self.inner.dispatch.write().await;
        *guard = Some(DispatchPool::start(self.clone(), settings));
        tracing::info!(
            "dispatch pool reloaded: workers={} queue={} rate={}ms",
            settings.worker_count,
            settings.queue_size,
            settings.rate_interval_ms
        );
    }

    #[must_use]
    pub async fn dispatch_settings(&self) -> DispatchSettings {
        self.inner
            .dispatch
            .read()
            .await
            .as_ref()
            .map_or(self.config().dispatch, DispatchPool::settings)
    }

    /// Entry point for cron fires. A full queue never drops the event: the
    /// task is executed directly, outside the rate limiter.
    pub async fn enqueue_fire(&self, task_id: i64) {
        let accepted = self
            .inner
            .dispatch
            .read()
            .await
            .as_ref()
            .is_some_and(|pool| pool.try_enqueue(task_id));

        if !accepted {
            tracing::warn!("dispatch queue full, executing task #{task_id} directly");
            let state = self.clone();
            tokio::spawn(async move {
                dispatch::run_dispatch(&state, task_id).await;
            });
        }
    }

    // ===== agent connection map =====

    /// Installs a connection handle for the agent, displacing (and closing)
    /// any previous one.
    pub async fn register_agent_conn(&self, agent_id: i64, ip: String) -> AgentConnGuard {
        let conn_seq = self.inner.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (close_tx, close_rx) = watch::channel(false);

        let handle = AgentConnHandle {
            agent_id,
            conn_seq,
            ip,
            outbound: outbound_tx,
            last_ping_ms: Arc::new(AtomicI64::new(now_unix_ms())),
            close_tx,
        };

        let displaced = {
            let mut guard = self.inner.connections.write().await;
            guard.insert(agent_id, handle)
        };
        if let Some(old) = displaced {
            tracing::info!("agent #{agent_id} reconnected, displacing previous connection");
            old.close();
            self.inner.limiter.release(&old.ip).await;
        }

        AgentConnGuard {
            conn_seq,
            outbound_rx,
            close_rx,
        }
    }

    /// Removes the connection if it is still the current one for the agent.
    pub async fn unregister_agent_conn(&self, agent_id: i64, conn_seq: u64) {
        let removed = {
            let mut guard = self.inner.connections.write().await;
            match guard.get(&agent_id) {
                Some(current) if current.conn_seq == conn_seq => guard.remove(&agent_id),
                _ => None,
            }
        };
        if let Some(handle) = removed {
            handle.close();
            self.inner.limiter.release(&handle.ip).await;
        }
    }

    /// True while `conn_seq` is the live connection for the agent; stale
    /// pumps use this to stop feeding frames into dispatch.
    pub async fn is_current_conn(&self, agent_id: i64, conn_seq: u64) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&agent_id)
            .is_some_and(|handle| handle.conn_seq == conn_seq)
    }

    pub async fn touch_agent_conn(&self, agent_id: i64) {
        if let Some(handle) = self.inner.connections.read().await.get(&agent_id) {
            handle.touch_ping();
        }
    }

    pub async fn online_conn_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Lossy send; returns false when the agent is offline or its buffer is
    /// full.
    pub async fn send_frame_to_agent(&self, agent_id: i64, frame: String) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(&agent_id)
            .is_some_and(|handle| handle.try_send(frame))
    }

    /// Pushes the agent's full current task set; the client replaces its
    /// schedule wholesale.
    pub async fn push_tasks_to_agent(&self, agent_id: i64) -> Result<(), DomainError> {
        let tasks = self
            .store()
            .list_agent_tasks(agent_id)
            .await?
            .iter()
            .map(AgentTaskView::from_task)
            .collect::<Vec<_>>();
        let frame = protocol::encode_frame(
            protocol::TYPE_TASKS,
            &protocol::TasksPayload { tasks },
        );
        self.send_frame_to_agent(agent_id, frame).await;
        Ok(())
    }

    /// Cuts connections whose last ping is older than `idle_cutoff_ms` and
    /// marks those agents offline.
    pub async fn sweep_connections(&self, idle_cutoff_ms: i64) {
        let now = now_unix_ms();
        let stale = {
            let guard = self.inner.connections.read().await;
            guard
                .values()
                .filter(|handle| now.saturating_sub(handle.last_ping_ms()) > idle_cutoff_ms)
                .map(|handle| (handle.agent_id, handle.conn_seq))
                .collect::<Vec<_>>()
        };

        for (agent_id, conn_seq) in stale {
            tracing::info!("agent #{agent_id} ping timeout, closing connection");
            self.unregister_agent_conn(agent_id, conn_seq).await;
            if let Err(error) = self.store().set_agent_status(agent_id, "offline").await {
                tracing::warn!("failed to mark agent #{agent_id} offline: {error}");
            }
        }
    }

    pub async fn health_payload(&self) -> Result<Value, DomainError> {
        let tasks = self.store().list_tasks().await?;
        let agents = self.store().list_agents().await?;
        let online = self.online_conn_count().await;
        let scheduled = self.inner.registry.list_active();

        Ok(json!({
            "ok": true,
            "ts": now_unix_ms(),
            "version": self.config().runtime_version,
            "uptime_ms": self.uptime_ms(),
            "tasks": tasks.len(),
            "scheduled": scheduled.len(),
            "agents": agents.len(),
            "agents_online": online,
        }))
    }
}

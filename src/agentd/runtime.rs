use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{RwLock, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    agentd::{self, config::AgentConfig, exec, update},
    application::clock::Clock,
    domain::models::{AgentTaskView, TaskResultReport},
    protocol::{self, FrameBody, HeartbeatPayload, TasksPayload},
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;

/// The worker-node runtime: one persistent gateway connection, a local
/// cron schedule for pushed tasks, and result reporting with an HTTP
/// fallback. Survives disconnects; the schedule keeps firing while the
/// connection is down.
pub struct AgentRuntime {
    config: Arc<AgentConfig>,
    machine_id: String,
    reporter: Reporter,
    schedule: Arc<LocalSchedule>,
}

impl AgentRuntime {
    #[must_use]
    pub fn new(config: AgentConfig, machine_id: String) -> Self {
        let config = Arc::new(config);
        let reporter = Reporter::new(Arc::clone(&config), machine_id.clone());
        let schedule = Arc::new(LocalSchedule::new(Clock::default(), reporter.clone()));
        Self {
            config,
            machine_id,
            reporter,
            schedule,
        }
    }

    #[must_use]
    pub fn schedule(&self) -> Arc<LocalSchedule> {
        Arc::clone(&self.schedule)
    }

    /// Connect-read-reconnect loop; never returns.
    pub async fn run(&self) {
        info!(
            "agent starting: server={} machine={}...",
            self.config.server_url,
            &self.machine_id[..self.machine_id.len().min(16)]
        );

        loop {
            match self.session().await {
                Ok(()) => warn!("connection closed, reconnecting in 5s"),
                Err(error) => warn!("connection failed: {error}, retrying in 5s"),
            }
            self.reporter.detach().await;
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn session(&self) -> Result<(), String> {
        let url = self.config.ws_url(&self.machine_id);
        let (socket, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| "handshake timed out".to_owned())?
            .map_err(|error| error.to_string())?;
        info!("connected to {}", self.config.server_url);

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        self.reporter.attach(tx.clone()).await;

        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let sent = match timeout(WRITE_DEADLINE, sink.send(message)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(error)) => {
                        debug!("send failed: {error}");
                        false
                    }
                    Err(_) => {
                        debug!("send hit the write deadline");
                        false
                    }
                };
                if !sent {
                    break;
                }
            }
        });

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.config),
            tx.clone(),
        ));

        let read_result = self.read_loop(&mut stream, &tx).await;

        heartbeat.abort();
        let _ = heartbeat.await;
        writer.abort();
        let _ = writer.await;
        read_result
    }

    async fn read_loop(
        &self,
        stream: &mut (impl futures_util::Stream<
            Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
        > + Unpin),
        tx: &mpsc::Sender<Message>,
    ) -> Result<(), String> {
        while let Some(next) = stream.next().await {
            let message = next.map_err(|error| error.to_string())?;
            match message {
                Message::Text(text) => self.handle_frame(text.as_str(), tx).await,
                Message::Binary(bytes) => {
                    if let Ok(text) = String::from_utf8(bytes.to_vec()) {
                        self.handle_frame(&text, tx).await;
                    }
                }
                Message::Ping(payload) => {
                    let _ = tx.try_send(Message::Pong(payload));
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, text: &str, tx: &mpsc::Sender<Message>) {
        let body = match protocol::parse_frame(text) {
            Ok(body) => body,
            Err(error) => {
                debug!("unreadable frame ignored: {error}");
                return;
            }
        };

        match body {
            FrameBody::Connected(payload) => {
                if payload.is_new_agent {
                    info!("registered as agent #{}", payload.agent_id);
                } else {
                    info!("recognized as agent #{}", payload.agent_id);
                }
                send_fetch_tasks(tx);
            }
            FrameBody::HeartbeatAck(ack) => {
                if ack.need_update && (self.config.auto_update || ack.force_update) {
                    info!("new version {} available, updating", ack.latest_version);
                    spawn_self_update(Arc::clone(&self.config));
                }
            }
            FrameBody::Tasks(TasksPayload { tasks }) => {
                self.schedule.apply(tasks);
            }
            FrameBody::Execute { task_id } => match self.schedule.get(task_id) {
                Some(view) => {
                    let reporter = self.reporter.clone();
                    tokio::spawn(async move {
                        let report = exec::execute_task(&view).await;
                        reporter.send(&report).await;
                    });
                }
                None => warn!("execute for unknown task #{task_id} ignored"),
            },
            FrameBody::Enabled => {
                info!("agent enabled, reloading tasks");
                send_fetch_tasks(tx);
            }
            FrameBody::Disabled => {
                warn!("agent disabled, clearing local schedule");
                self.schedule.clear();
            }
            FrameBody::Update => {
                info!("update instructed by server");
                spawn_self_update(Arc::clone(&self.config));
            }
            FrameBody::Other(kind) => debug!("ignoring frame type {kind}"),
            _ => {}
        }
    }
}

fn send_fetch_tasks(tx: &mpsc::Sender<Message>) {
    let frame = protocol::encode_empty_frame(protocol::TYPE_FETCH_TASKS);
    let _ = tx.try_send(Message::Text(frame.into()));
}

fn spawn_self_update(config: Arc<AgentConfig>) {
    tokio::spawn(async move {
        match update::self_update(&config).await {
            Ok(()) => update::restart(),
            Err(error) => warn!("self-update failed, keeping current binary: {error}"),
        }
    });
}

async fn heartbeat_loop(config: Arc<AgentConfig>, tx: mpsc::Sender<Message>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    loop {
        ticker.tick().await;
        let payload = HeartbeatPayload {
            version: agentd::VERSION.to_owned(),
            build_time: agentd::BUILD_TIME.to_owned(),
            hostname: sysinfo::System::host_name().unwrap_or_default(),
            os: agentd::os_name().to_owned(),
            arch: agentd::arch_name().to_owned(),
            auto_update: config.auto_update,
        };
        let frame = protocol::encode_frame(protocol::TYPE_HEARTBEAT, &payload);
        if tx.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }
}

/// Delivers results over the live connection, falling back to the HTTP
/// report endpoint when the socket is down or its buffer full.
#[derive(Clone)]
pub struct Reporter {
    config: Arc<AgentConfig>,
    machine_id: String,
    outbound: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    http: reqwest::Client,
}

impl Reporter {
    fn new(config: Arc<AgentConfig>, machine_id: String) -> Self {
        Self {
            config,
            machine_id,
            outbound: Arc::new(RwLock::new(None)),
            http: reqwest::Client::new(),
        }
    }

    async fn attach(&self, tx: mpsc::Sender<Message>) {
        *self.outbound.write().await = Some(tx);
    }

    async fn detach(&self) {
        *self.outbound.write().await = None;
    }

    pub async fn send(&self, report: &TaskResultReport) {
        let frame = protocol::encode_frame(protocol::TYPE_TASK_RESULT, report);
        let sent = self
            .outbound
            .read()
            .await
            .as_ref()
            .is_some_and(|tx| tx.try_send(Message::Text(frame.into())).is_ok());

        if sent {
            return;
        }

        warn!(
            "websocket delivery failed for task #{}, reporting over http",
            report.task_id
        );
        if let Err(error) = self.report_http(report).await {
            warn!("http report failed for task #{}: {error}", report.task_id);
        }
    }

    async fn report_http(&self, report: &TaskResultReport) -> Result<(), String> {
        let url = format!(
            "{}/api/agent/report",
            self.config.server_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.token)
            .header("X-Machine-ID", &self.machine_id)
            .json(report)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|error| error.to_string())?;

        if !response.status().is_success() {
            return Err(format!("server answered {}", response.status()));
        }
        Ok(())
    }
}

/// Cron entries for the tasks pushed to this node. Applying a `tasks`
/// frame is an idempotent wholesale replacement: unchanged
/// `(schedule, command)` pairs keep their timers.
pub struct LocalSchedule {
    clock: Clock,
    reporter: Reporter,
    entries: Mutex<HashMap<i64, LocalEntry>>,
}

struct LocalEntry {
    fingerprint: u64,
    view: AgentTaskView,
    timer: JoinHandle<()>,
}

impl Drop for LocalEntry {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

impl LocalSchedule {
    #[must_use]
    pub fn new(clock: Clock, reporter: Reporter) -> Self {
        Self {
            clock,
            reporter,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply(&self, tasks: Vec<AgentTaskView>) {
        let mut entries = lock(&self.entries);

        let incoming_ids = tasks.iter().map(|task| task.id).collect::<Vec<_>>();
        entries.retain(|id, _| {
            let keep = incoming_ids.contains(id);
            if !keep {
                info!("task #{id} removed from schedule");
            }
            keep
        });

        for task in tasks {
            if !task.enabled {
                entries.remove(&task.id);
                continue;
            }
            let fingerprint = fingerprint(&task.schedule, &task.command);
            if entries
                .get(&task.id)
                .is_some_and(|entry| entry.fingerprint == fingerprint)
            {
                continue;
            }

            if crate::application::clock::validate_schedule(&task.schedule).is_err() {
                warn!("task #{} has an invalid schedule, skipped", task.id);
                entries.remove(&task.id);
                continue;
            }

            info!("scheduling task #{} {} ({})", task.id, task.name, task.schedule);
            let timer = tokio::spawn(local_timer_loop(
                self.clock,
                task.clone(),
                self.reporter.clone(),
            ));
            entries.insert(
                task.id,
                LocalEntry {
                    fingerprint,
                    view: task,
                    timer,
                },
            );
        }
    }

    pub fn clear(&self) {
        let mut entries = lock(&self.entries);
        entries.clear();
        info!("local schedule cleared");
    }

    #[must_use]
    pub fn get(&self, task_id: i64) -> Option<AgentTaskView> {
        lock(&self.entries).get(&task_id).map(|entry| entry.view.clone())
    }

    #[must_use]
    pub fn task_ids(&self) -> Vec<i64> {
        let mut ids = lock(&self.entries).keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(entries: &Mutex<HashMap<i64, LocalEntry>>) -> std::sync::MutexGuard<'_, HashMap<i64, LocalEntry>> {
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

async fn local_timer_loop(clock: Clock, task: AgentTaskView, reporter: Reporter) {
    loop {
        let now = clock.now();
        let next = match clock.next_fire(&task.schedule, now) {
            Ok(next) => next,
            Err(error) => {
                warn!("task #{} timer stopped: {error}", task.id);
                return;
            }
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;

        // Fire-and-report off the timer so slow commands cannot skew the
        // schedule.
        let view = task.clone();
        let reporter = reporter.clone();
        tokio::spawn(async move {
            let report = exec::execute_task(&view).await;
            reporter.send(&report).await;
        });
    }
}

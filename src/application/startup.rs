use std::{future::Future, time::Duration};

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

use crate::{
    application::{
        agents::AGENT_IDLE_CUTOFF_MS,
        config::{Args, RuntimeConfig},
        state::SharedState,
    },
    domain::error::DomainError,
    interfaces::http,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn run(args: Args) -> Result<(), DomainError> {
    let config = RuntimeConfig::from_args(args)
        .map_err(|error| DomainError::InvalidRequest(format!("configuration error: {error}")))?;

    init_logging(&config.log_filter, config.json_logs)?;
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .map_err(|error| DomainError::Unavailable(format!("failed to bind listener: {error}")))?;

    let signal = shutdown_signal();
    run_with_listener(listener, config, signal).await
}

pub async fn run_with_listener(
    listener: TcpListener,
    config: RuntimeConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DomainError> {
    info!(
        "starting baihu-server host={} port={} workers={} queue={}",
        config.host, config.port, config.dispatch.worker_count, config.dispatch.queue_size
    );

    tokio::fs::create_dir_all(&config.scripts_dir)
        .await
        .map_err(|error| {
            DomainError::Unavailable(format!("failed to create scripts dir: {error}"))
        })?;

    let state = SharedState::new(config).await?;
    state.start_runtime().await?;
    let sweeper = spawn_sweeper(state.clone());

    let serve_result = http::serve(listener, state, shutdown).await;

    sweeper.abort();
    let _ = sweeper.await;

    serve_result
}

fn init_logging(filter: &str, json_logs: bool) -> Result<(), DomainError> {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(env_filter).with_target(false);

    if json_logs {
        builder.json().try_init().map_err(|error| {
            DomainError::Unavailable(format!("failed to initialize logger: {error}"))
        })?;
    } else {
        builder.compact().try_init().map_err(|error| {
            DomainError::Unavailable(format!("failed to initialize logger: {error}"))
        })?;
    }

    Ok(())
}

/// One loop covers all periodic hygiene: idle-connection cuts, offline
/// marking, and rate-limiter garbage collection.
fn spawn_sweeper(state: SharedState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            state.sweep_connections(AGENT_IDLE_CUTOFF_MS).await;
            if let Err(err) = state.sweep_offline_agents().await {
                error!("offline sweep failed: {err}");
            }
            state.limiter().gc().await;
        }
    })
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

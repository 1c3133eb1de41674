use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};

use clap::Parser;

use crate::application::clock::{Clock, DEFAULT_ZONE_OFFSET_SECS};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "baihu-server",
    version,
    about = "Baihu task server: cron scheduling, local execution, remote agents"
)]
pub struct Args {
    #[arg(long, env = "BAIHU_HOST", default_value = "127.0.0.1")]
    pub host: IpAddr,

    #[arg(long, env = "BAIHU_PORT", default_value_t = 18060)]
    pub port: u16,

    #[arg(long, env = "BAIHU_DB_PATH", default_value = "./data/baihu.db")]
    pub db_path: PathBuf,

    /// Base directory for tasks with empty or relative working directories.
    #[arg(long, env = "BAIHU_SCRIPTS_DIR", default_value = "./data/scripts")]
    pub scripts_dir: PathBuf,

    /// Directory holding agent release bundles and version.txt.
    #[arg(long, env = "BAIHU_AGENT_DIR", default_value = "./data/agent")]
    pub agent_dir: PathBuf,

    /// Zone applied to all cron computation, seconds east of UTC.
    #[arg(long, env = "BAIHU_TZ_OFFSET_SECS", default_value_t = DEFAULT_ZONE_OFFSET_SECS)]
    pub tz_offset_secs: i32,

    #[arg(long, env = "BAIHU_WORKER_COUNT", default_value_t = 4)]
    pub worker_count: usize,

    #[arg(long, env = "BAIHU_QUEUE_SIZE", default_value_t = 100)]
    pub queue_size: usize,

    /// One task start is admitted per interval, across all workers.
    #[arg(long, env = "BAIHU_RATE_INTERVAL_MS", default_value_t = 200)]
    pub rate_interval_ms: u64,

    /// Skip real local execution and record synthetic successes.
    #[arg(long, env = "BAIHU_DEMO_MODE", default_value_t = false)]
    pub demo_mode: bool,

    #[arg(long, env = "BAIHU_RUNTIME_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub runtime_version: String,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,

    #[arg(long, env = "BAIHU_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

/// Worker pool knobs; a reload rebuilds the pool with a fresh copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub worker_count: usize,
    pub queue_size: usize,
    pub rate_interval_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_size: 100,
            rate_interval_ms: 200,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub host: IpAddr,
    pub port: u16,
    pub db_path: PathBuf,
    pub scripts_dir: PathBuf,
    pub agent_dir: PathBuf,
    pub clock: Clock,
    pub dispatch: DispatchSettings,
    pub demo_mode: bool,
    pub runtime_version: String,
    pub log_filter: String,
    pub json_logs: bool,
}

impl RuntimeConfig {
    pub fn from_args(args: Args) -> Result<Self, String> {
        if args.port == 0 {
            return Err("port must be greater than 0".to_owned());
        }
        if args.worker_count == 0 {
            return Err("worker_count must be greater than 0".to_owned());
        }
        if args.queue_size == 0 {
            return Err("queue_size must be greater than 0".to_owned());
        }
        if args.rate_interval_ms == 0 {
            return Err("rate_interval_ms must be greater than 0".to_owned());
        }
        let clock = Clock::with_offset_secs(args.tz_offset_secs)
            .ok_or_else(|| format!("invalid tz offset: {}", args.tz_offset_secs))?;

        Ok(Self {
            host: args.host,
            port: args.port,
            db_path: args.db_path,
            scripts_dir: args.scripts_dir,
            agent_dir: args.agent_dir,
            clock,
            dispatch: DispatchSettings {
                worker_count: args.worker_count,
                queue_size: args.queue_size,
                rate_interval_ms: args.rate_interval_ms,
            },
            demo_mode: args.demo_mode,
            runtime_version: args.runtime_version,
            log_filter: args.log_filter,
            json_logs: args.json_logs,
        })
    }

    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    #[must_use]
    pub fn for_test(host: IpAddr, port: u16, data_dir: PathBuf) -> Self {
        Self {
            host,
            port,
            db_path: data_dir.join("baihu.db"),
            scripts_dir: data_dir.join("scripts"),
            agent_dir: data_dir.join("agent"),
            clock: Clock::default(),
            dispatch: DispatchSettings {
                worker_count: 2,
                queue_size: 16,
                rate_interval_ms: 10,
            },
            demo_mode: false,
            runtime_version: "test".to_owned(),
            log_filter: "warn".to_owned(),
            json_logs: false,
        }
    }
}

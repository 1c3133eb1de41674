use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use crate::{
    agentd::{self, config::AgentConfig, instance, runtime::AgentRuntime, service},
    security::identity,
};

const LOG_MAX_SIZE: u64 = 5 * 1024 * 1024;
const LOG_BACKUPS: usize = 3;
const LOG_TAIL_LINES: usize = 50;

#[derive(Debug, Parser)]
#[command(
    name = "baihu-agent",
    version = agentd::VERSION,
    about = "Baihu worker-node agent"
)]
pub struct AgentArgs {
    #[command(subcommand)]
    pub command: AgentCommand,

    /// Config file path.
    #[arg(short = 'c', long = "config", global = true, default_value = "config.ini")]
    pub config: PathBuf,

    /// Log file path.
    #[arg(short = 'l', long = "log", global = true, default_value = "logs/agent.log")]
    pub log: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    /// Start in the background.
    Start,
    /// Run in the foreground.
    Run {
        /// Detach and run in the background instead.
        #[arg(short = 'd', long = "daemon")]
        daemon: bool,
    },
    /// Stop a running instance.
    Stop {
        /// Start a fresh instance after stopping.
        #[arg(long)]
        restart: bool,
    },
    /// Show whether an instance is running.
    Status,
    /// Fetch and print this agent's task list from the server.
    Tasks,
    /// Print the tail of the log file.
    Logs,
    /// Register as a native system service.
    Install,
    /// Remove the system service registration.
    Uninstall,
    /// Print version information.
    Version,
}

/// Entry point for the `baihu-agent` binary; returns the process exit code.
pub async fn run(args: AgentArgs) -> i32 {
    // Paths in config.ini and the data/ tree are relative to the binary.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let _ = std::env::set_current_dir(dir);
        }
    }

    let outcome = match args.command {
        AgentCommand::Start => cmd_start(&args.config, &args.log),
        AgentCommand::Run { daemon: true } => cmd_start(&args.config, &args.log),
        AgentCommand::Run { daemon: false } => cmd_run(&args.config, &args.log).await,
        AgentCommand::Stop { restart } => {
            let stopped = cmd_stop();
            if stopped.is_ok() && restart {
                cmd_start(&args.config, &args.log)
            } else {
                stopped
            }
        }
        AgentCommand::Status => cmd_status(),
        AgentCommand::Tasks => cmd_tasks(&args.config).await,
        AgentCommand::Logs => cmd_logs(&args.log),
        AgentCommand::Install => {
            std::env::current_exe()
                .map_err(|error| format!("cannot resolve executable: {error}"))
                .and_then(|exe| service::install(&exe))
        }
        AgentCommand::Uninstall => service::uninstall(),
        AgentCommand::Version => {
            println!("baihu-agent v{}", agentd::VERSION);
            if !agentd::BUILD_TIME.is_empty() {
                println!("build time: {}", agentd::BUILD_TIME);
            }
            Ok(())
        }
    };

    match outcome {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("error: {error}");
            1
        }
    }
}

async fn cmd_run(config_path: &Path, log_path: &Path) -> Result<(), String> {
    init_logging(log_path)?;

    let config = AgentConfig::load(config_path)?;
    config.validate()?;

    let base_dir = std::env::current_dir()
        .map_err(|error| format!("cannot resolve working directory: {error}"))?;
    let _lock = instance::InstanceLock::acquire(&base_dir)?;

    let machine_id = identity::machine_identity();
    info!("baihu-agent v{}", agentd::VERSION);
    info!("server: {}", config.server_url);
    info!("name: {}", config.name);
    info!("machine id: {}...", &machine_id[..16.min(machine_id.len())]);

    let runtime = AgentRuntime::new(config, machine_id);
    tokio::select! {
        () = runtime.run() => {}
        _ = tokio::signal::ctrl_c() => info!("stopping"),
    }
    Ok(())
}

fn cmd_start(config_path: &Path, log_path: &Path) -> Result<(), String> {
    let exe = std::env::current_exe()
        .map_err(|error| format!("cannot resolve executable: {error}"))?;

    let child = std::process::Command::new(exe)
        .arg("run")
        .arg("-c")
        .arg(config_path)
        .arg("-l")
        .arg(log_path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|error| format!("failed to start background instance: {error}"))?;

    println!("agent started (pid {})", child.id());
    Ok(())
}

fn cmd_stop() -> Result<(), String> {
    let base_dir = std::env::current_dir()
        .map_err(|error| format!("cannot resolve working directory: {error}"))?;
    let Some(pid) = instance::read_pid(&base_dir) else {
        println!("agent is not running");
        return Ok(());
    };

    #[cfg(unix)]
    {
        use nix::{sys::signal, unistd::Pid};
        if let Err(errno) = signal::kill(Pid::from_raw(pid), signal::Signal::SIGTERM) {
            instance::remove_pid_file(&base_dir);
            return Err(format!("failed to signal pid {pid}: {errno}"));
        }
    }
    #[cfg(not(unix))]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .status()
            .map_err(|error| format!("failed to run taskkill: {error}"))?;
        if !status.success() {
            return Err(format!("taskkill failed for pid {pid}"));
        }
    }

    instance::remove_pid_file(&base_dir);
    println!("agent stopped (pid {pid})");
    Ok(())
}

fn cmd_status() -> Result<(), String> {
    let base_dir = std::env::current_dir()
        .map_err(|error| format!("cannot resolve working directory: {error}"))?;
    let Some(pid) = instance::read_pid(&base_dir) else {
        println!("status: not running");
        return Ok(());
    };

    let alive = process_alive(pid);
    if alive {
        println!("status: running (pid {pid})");
    } else {
        instance::remove_pid_file(&base_dir);
        println!("status: not running");
    }
    Ok(())
}

fn process_alive(pid: i32) -> bool {
    #[cfg(unix)]
    {
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

async fn cmd_tasks(config_path: &Path) -> Result<(), String> {
    let config = AgentConfig::load(config_path)?;
    config.validate()?;
    let machine_id = identity::machine_identity();

    let url = format!(
        "{}/api/agent/tasks",
        config.server_url.trim_end_matches('/')
    );
    let response = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&config.token)
        .header("X-Machine-ID", &machine_id)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .map_err(|error| format!("request failed: {error}"))?;

    if !response.status().is_success() {
        return Err(format!("server answered {}", response.status()));
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|error| format!("unreadable response: {error}"))?;

    let tasks = body["tasks"].as_array().cloned().unwrap_or_default();
    println!("{} task(s)", tasks.len());
    for task in tasks {
        println!(
            "  #{} {} [{}] {}",
            task["id"],
            task["name"].as_str().unwrap_or("?"),
            task["schedule"].as_str().unwrap_or("?"),
            task["command"].as_str().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_logs(log_path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(log_path)
        .map_err(|error| format!("cannot read {}: {error}", log_path.display()))?;
    let lines = text.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    for line in &lines[start..] {
        println!("{line}");
    }
    Ok(())
}

fn init_logging(log_path: &Path) -> Result<(), String> {
    let rotating = RotatingFile::open(log_path, LOG_MAX_SIZE, LOG_BACKUPS)
        .map_err(|error| format!("cannot open log file: {error}"))?;
    let writer = io::stdout.and(rotating);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_ansi(false)
        .with_writer(writer)
        .try_init()
        .map_err(|error| format!("failed to initialize logger: {error}"))?;
    Ok(())
}

/// Size-rotating log sink: at 5 MB the file shifts to `.1`, pushing older
/// generations up to the backup limit.
#[derive(Clone)]
struct RotatingFile {
    inner: Arc<Mutex<RotatingInner>>,
}

struct RotatingInner {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    backups: usize,
}

impl RotatingFile {
    fn open(path: &Path, max_size: u64, backups: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingInner {
                path: path.to_path_buf(),
                file,
                written,
                max_size,
                backups,
            })),
        })
    }
}

impl RotatingInner {
    fn rotate(&mut self) -> io::Result<()> {
        for index in (1..self.backups).rev() {
            let from = numbered(&self.path, index);
            let to = numbered(&self.path, index + 1);
            if from.exists() {
                let _ = std::fs::rename(&from, &to);
            }
        }
        let _ = std::fs::rename(&self.path, numbered(&self.path, 1));
        self.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn numbered(path: &Path, index: usize) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.{index}"))
}

impl io::Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.written + buf.len() as u64 > inner.max_size {
            inner.rotate()?;
        }
        let written = inner.file.write(buf)?;
        inner.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        inner.file.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingFile {
    type Writer = RotatingFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

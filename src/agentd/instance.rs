use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

/// Exclusive lock for the whole agent process, taken before any mutable
/// state exists and held until exit. The pid file rides along for the
/// `stop`/`status` commands.
pub struct InstanceLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _lock: File,
    pid_path: PathBuf,
}

impl InstanceLock {
    /// Locks `data/agent.lock` under `base_dir` and writes `data/agent.pid`.
    /// Fails when another instance holds the lock.
    pub fn acquire(base_dir: &Path) -> Result<Self, String> {
        let data_dir = base_dir.join("data");
        std::fs::create_dir_all(&data_dir)
            .map_err(|error| format!("failed to create data dir: {error}"))?;

        let lock_path = data_dir.join("agent.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|error| format!("failed to open {}: {error}", lock_path.display()))?;

        #[cfg(unix)]
        let lock = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| format!("another agent instance is running ({errno})"))?;
        #[cfg(not(unix))]
        let lock = file;

        let pid_path = data_dir.join("agent.pid");
        let mut pid_file = File::create(&pid_path)
            .map_err(|error| format!("failed to create pid file: {error}"))?;
        write!(pid_file, "{}", std::process::id())
            .map_err(|error| format!("failed to write pid file: {error}"))?;

        Ok(Self {
            _lock: lock,
            pid_path,
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.pid_path);
    }
}

/// Pid from `data/agent.pid`, if present and parseable.
#[must_use]
pub fn read_pid(base_dir: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(base_dir.join("data").join("agent.pid")).ok()?;
    text.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

pub fn remove_pid_file(base_dir: &Path) {
    let _ = std::fs::remove_file(base_dir.join("data").join("agent.pid"));
}

#[cfg(test)]
mod tests {
    use super::{InstanceLock, read_pid};

    #[test]
    fn lock_is_exclusive_within_a_process() {
        let dir = tempfile::tempdir().expect("temp dir");
        let first = InstanceLock::acquire(dir.path()).expect("first lock");
        assert!(InstanceLock::acquire(dir.path()).is_err());

        assert_eq!(read_pid(dir.path()), i32::try_from(std::process::id()).ok());

        drop(first);
        assert_eq!(read_pid(dir.path()), None);
        let _second = InstanceLock::acquire(dir.path()).expect("relock after release");
    }
}

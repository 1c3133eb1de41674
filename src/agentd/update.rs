use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use flate2::read::GzDecoder;
use tracing::{info, warn};

use crate::agentd::{self, config::AgentConfig};

static UPDATE_IN_FLIGHT: AtomicBool = AtomicBool::new(false);

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Downloads the platform bundle and swaps the running binary. The old
/// image survives as `<name>.bak`; on any failure the current binary stays
/// in place and the next update trigger retries.
pub async fn self_update(config: &AgentConfig) -> Result<(), String> {
    if UPDATE_IN_FLIGHT.swap(true, Ordering::SeqCst) {
        return Err("an update is already in progress".to_owned());
    }
    let result = run_update(config).await;
    if result.is_err() {
        UPDATE_IN_FLIGHT.store(false, Ordering::SeqCst);
    }
    result
}

async fn run_update(config: &AgentConfig) -> Result<(), String> {
    let exe = std::env::current_exe()
        .map_err(|error| format!("cannot resolve current executable: {error}"))?;
    let exe_dir = exe
        .parent()
        .ok_or_else(|| "executable has no parent directory".to_owned())?
        .to_path_buf();

    let url = format!(
        "{}/api/agent/download?os={}&arch={}",
        config.server_url.trim_end_matches('/'),
        agentd::os_name(),
        agentd::arch_name()
    );
    info!("downloading {url}");

    let bytes = reqwest::Client::new()
        .get(&url)
        .bearer_auth(&config.token)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|error| format!("download failed: {error}"))?
        .error_for_status()
        .map_err(|error| format!("download refused: {error}"))?
        .bytes()
        .await
        .map_err(|error| format!("download interrupted: {error}"))?;

    let binary_name = if cfg!(windows) {
        "baihu-agent.exe"
    } else {
        "baihu-agent"
    };
    let payload = bytes.to_vec();
    let name = binary_name.to_owned();
    let new_binary = tokio::task::spawn_blocking(move || extract_binary(&payload, &name))
        .await
        .map_err(|error| format!("extraction task failed: {error}"))??;

    let staged = exe_dir.join(format!("{binary_name}.new"));
    tokio::fs::write(&staged, &new_binary)
        .await
        .map_err(|error| format!("failed to stage new binary: {error}"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|error| format!("failed to mark binary executable: {error}"))?;
    }

    let base = canonical_base(&exe);
    let backup = backup_path(&base);

    // Running from the canonical path: back the old image up first.
    // Running from a .bak (recovery case): the old image is disposable.
    if exe != backup {
        let _ = tokio::fs::remove_file(&backup).await;
        if let Err(error) = tokio::fs::rename(&exe, &backup).await {
            let _ = tokio::fs::remove_file(&staged).await;
            return Err(format!("failed to back up current binary: {error}"));
        }
    }

    if let Err(error) = tokio::fs::rename(&staged, &base).await {
        if exe != backup {
            let _ = tokio::fs::rename(&backup, &exe).await;
        }
        return Err(format!("failed to install new binary: {error}"));
    }

    if exe == backup {
        let _ = tokio::fs::remove_file(&exe).await;
    }

    info!("update installed at {}", base.display());
    Ok(())
}

/// Re-exec under the canonical path so the replacement image takes over.
/// POSIX replaces the current process; Windows spawns and exits.
pub fn restart() {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            warn!("restart skipped, executable unknown: {error}");
            return;
        }
    };
    let base = canonical_base(&exe);
    info!("restarting as {}", base.display());

    #[cfg(unix)]
    {
        use std::ffi::CString;
        let path = CString::new(base.as_os_str().to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = [
            CString::new("baihu-agent").unwrap_or_default(),
            CString::new("run").unwrap_or_default(),
        ];
        if let Err(errno) = nix::unistd::execv(&path, &args) {
            warn!("exec of new binary failed: {errno}");
            std::process::exit(1);
        }
    }
    #[cfg(not(unix))]
    {
        match std::process::Command::new(&base).arg("run").spawn() {
            Ok(_) => std::process::exit(0),
            Err(error) => {
                warn!("spawn of new binary failed: {error}");
                std::process::exit(1);
            }
        }
    }
}

/// Strips any chain of `.bak` suffixes off the executable name; updates
/// always land at the canonical path.
#[must_use]
pub fn canonical_base(path: &Path) -> PathBuf {
    let Some(name) = path.file_name().map(|name| name.to_string_lossy().into_owned()) else {
        return path.to_path_buf();
    };
    let mut trimmed = name.as_str();
    while let Some(shorter) = trimmed.strip_suffix(".bak") {
        trimmed = shorter;
    }
    path.with_file_name(trimmed)
}

fn backup_path(base: &Path) -> PathBuf {
    let name = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{name}.bak"))
}

/// Pulls the named file out of a gzip tarball.
fn extract_binary(bundle: &[u8], binary_name: &str) -> Result<Vec<u8>, String> {
    let mut archive = tar::Archive::new(GzDecoder::new(bundle));
    let entries = archive
        .entries()
        .map_err(|error| format!("unreadable bundle: {error}"))?;

    for entry in entries {
        let mut entry = entry.map_err(|error| format!("corrupt bundle entry: {error}"))?;
        let path = entry
            .path()
            .map_err(|error| format!("bundle entry path: {error}"))?;
        let matches = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy() == binary_name);
        if !matches {
            continue;
        }

        let mut binary = Vec::new();
        entry
            .read_to_end(&mut binary)
            .map_err(|error| format!("failed to read binary from bundle: {error}"))?;
        return Ok(binary);
    }

    Err(format!("bundle does not contain {binary_name}"))
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path};

    use flate2::{Compression, write::GzEncoder};

    use super::{backup_path, canonical_base, extract_binary};

    fn bundle_with(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).expect("append");
        }
        let encoder = builder.into_inner().expect("finish tar");
        encoder.finish().expect("finish gzip")
    }

    #[test]
    fn canonical_base_strips_bak_chains() {
        assert_eq!(
            canonical_base(Path::new("/opt/agent/baihu-agent")),
            Path::new("/opt/agent/baihu-agent")
        );
        assert_eq!(
            canonical_base(Path::new("/opt/agent/baihu-agent.bak")),
            Path::new("/opt/agent/baihu-agent")
        );
        assert_eq!(
            canonical_base(Path::new("/opt/agent/baihu-agent.bak.bak")),
            Path::new("/opt/agent/baihu-agent")
        );
    }

    #[test]
    fn backup_path_appends_one_bak() {
        assert_eq!(
            backup_path(Path::new("/opt/agent/baihu-agent")),
            Path::new("/opt/agent/baihu-agent.bak")
        );
    }

    #[test]
    fn extract_finds_the_binary_among_other_files() {
        let bundle = bundle_with(&[
            ("config.example.ini", b"[agent]\n".as_slice()),
            ("baihu-agent", b"\x7fELF fake binary".as_slice()),
        ]);
        let binary = extract_binary(&bundle, "baihu-agent").expect("binary expected");
        assert_eq!(binary, b"\x7fELF fake binary");
    }

    #[test]
    fn extract_fails_cleanly_when_binary_missing() {
        let bundle = bundle_with(&[("config.example.ini", b"[agent]\n".as_slice())]);
        let error = extract_binary(&bundle, "baihu-agent").expect_err("must fail");
        assert!(error.contains("baihu-agent"));
    }

    #[test]
    fn extract_rejects_garbage() {
        let mut garbage = GzEncoder::new(Vec::new(), Compression::default());
        garbage.write_all(b"not a tarball").expect("write");
        let bytes = garbage.finish().expect("finish");
        assert!(extract_binary(&bytes, "baihu-agent").is_err());
    }
}

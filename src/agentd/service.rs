use std::path::Path;
use std::process::Command;

pub const SERVICE_NAME: &str = "baihu-agent";
const SERVICE_DESC: &str = "Baihu Agent Service";

/// Registers the agent as a native service: a systemd unit on Linux,
/// `sc create` on Windows. Prints operator guidance on success.
pub fn install(exe: &Path) -> Result<(), String> {
    let exe_dir = exe
        .parent()
        .ok_or_else(|| "executable has no parent directory".to_owned())?;

    if cfg!(windows) {
        install_windows(exe)
    } else {
        install_systemd(exe, exe_dir)
    }
}

pub fn uninstall() -> Result<(), String> {
    if cfg!(windows) {
        uninstall_windows()
    } else {
        uninstall_systemd()
    }
}

fn install_systemd(exe: &Path, exe_dir: &Path) -> Result<(), String> {
    let unit = format!(
        "[Unit]\n\
         Description={SERVICE_DESC}\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         WorkingDirectory={}\n\
         ExecStart={} run\n\
         Restart=always\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe_dir.display(),
        exe.display()
    );

    let unit_path = format!("/etc/systemd/system/{SERVICE_NAME}.service");
    std::fs::write(&unit_path, unit)
        .map_err(|error| format!("failed to write {unit_path} (run with sudo?): {error}"))?;

    run_quiet("systemctl", &["daemon-reload"]);
    run_quiet("systemctl", &["enable", SERVICE_NAME]);

    println!("service installed: {unit_path}");
    println!("manage it with:");
    println!("  sudo systemctl start {SERVICE_NAME}");
    println!("  sudo systemctl stop {SERVICE_NAME}");
    println!("  sudo systemctl status {SERVICE_NAME}");
    Ok(())
}

fn uninstall_systemd() -> Result<(), String> {
    run_quiet("systemctl", &["stop", SERVICE_NAME]);
    run_quiet("systemctl", &["disable", SERVICE_NAME]);

    let unit_path = format!("/etc/systemd/system/{SERVICE_NAME}.service");
    std::fs::remove_file(&unit_path)
        .map_err(|error| format!("failed to remove {unit_path} (run with sudo?): {error}"))?;
    run_quiet("systemctl", &["daemon-reload"]);
    println!("service uninstalled");
    Ok(())
}

fn install_windows(exe: &Path) -> Result<(), String> {
    let bin_path = format!("\"{}\" run", exe.display());
    let status = Command::new("sc")
        .args([
            "create",
            SERVICE_NAME,
            "binPath=",
            &bin_path,
            "start=",
            "auto",
            "DisplayName=",
            SERVICE_DESC,
        ])
        .status()
        .map_err(|error| format!("failed to run sc (run as administrator?): {error}"))?;
    if !status.success() {
        return Err("sc create failed (run as administrator?)".to_owned());
    }
    run_quiet("sc", &["description", SERVICE_NAME, SERVICE_DESC]);

    println!("service installed");
    println!("manage it with:");
    println!("  sc start {SERVICE_NAME}");
    println!("  sc stop {SERVICE_NAME}");
    println!("  sc query {SERVICE_NAME}");
    Ok(())
}

fn uninstall_windows() -> Result<(), String> {
    run_quiet("sc", &["stop", SERVICE_NAME]);
    let status = Command::new("sc")
        .args(["delete", SERVICE_NAME])
        .status()
        .map_err(|error| format!("failed to run sc (run as administrator?): {error}"))?;
    if !status.success() {
        return Err("sc delete failed (run as administrator?)".to_owned());
    }
    println!("service uninstalled");
    Ok(())
}

fn run_quiet(program: &str, args: &[&str]) {
    let _ = Command::new(program)
        .args(args)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
}

use sha2::{Digest, Sha256};

/// Interface-name prefixes that do not survive reboots or re-installs.
const VIRTUAL_PREFIXES: &[&str] = &["docker", "veth", "br-", "virbr"];

/// Deterministic identifier for the host this process runs on:
/// `hostname | primary MAC | os | arch`, SHA-256, lowercase hex. The
/// primary MAC is the lexicographically smallest address of a physical,
/// non-loopback interface, so the value is stable across restarts and
/// still distinct for cloud instances that share a hostname image.
#[must_use]
pub fn machine_identity() -> String {
    let hostname = sysinfo::System::host_name().unwrap_or_default();
    let mac = primary_mac().unwrap_or_default();
    compute_identity(&hostname, &mac, std::env::consts::OS, std::env::consts::ARCH)
}

#[must_use]
pub fn compute_identity(hostname: &str, mac: &str, os: &str, arch: &str) -> String {
    let mut parts = Vec::with_capacity(4);
    if !hostname.is_empty() {
        parts.push(hostname);
    }
    if !mac.is_empty() {
        parts.push(mac);
    }
    parts.push(os);
    parts.push(arch);

    let digest = Sha256::digest(parts.join("|").as_bytes());
    digest.iter().fold(String::with_capacity(64), |mut out, byte| {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        out
    })
}

fn primary_mac() -> Option<String> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut macs = networks
        .iter()
        .filter(|(name, _)| !is_virtual_interface(name))
        .map(|(_, data)| data.mac_address().to_string())
        .filter(|mac| !mac.is_empty() && mac != "00:00:00:00:00:00")
        .collect::<Vec<_>>();
    macs.sort();
    macs.into_iter().next()
}

fn is_virtual_interface(name: &str) -> bool {
    let name = name.to_lowercase();
    name == "lo"
        || name == "lo0"
        || VIRTUAL_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix))
}

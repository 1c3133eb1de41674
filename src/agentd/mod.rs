pub mod cli;
pub mod config;
pub mod exec;
pub mod instance;
pub mod runtime;
pub mod service;
pub mod update;

/// Version string baked into the binary and reported in heartbeats.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Set at release time through the build environment; empty for dev builds.
pub const BUILD_TIME: &str = match option_env!("BAIHU_BUILD_TIME") {
    Some(value) => value,
    None => "",
};

/// OS name as used in bundle filenames and heartbeats.
#[must_use]
pub fn os_name() -> &'static str {
    std::env::consts::OS
}

/// Architecture under the naming scheme the update server uses.
#[must_use]
pub fn arch_name() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

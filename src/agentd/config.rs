use std::path::Path;

/// `[agent]` section of config.ini. Keys are case-sensitive; the heartbeat
/// interval is in seconds.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub name: String,
    pub token: String,
    pub interval_secs: u64,
    pub auto_update: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            name: String::new(),
            token: String::new(),
            interval_secs: 30,
            auto_update: false,
        }
    }
}

impl AgentConfig {
    /// Loads the config file when present, then applies `AGENT_SERVER` and
    /// `AGENT_NAME` environment overrides. A missing file is not an error;
    /// missing required values surface in `validate`.
    pub fn load(path: &Path) -> Result<Self, String> {
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(text) => apply_ini(&mut config, &text),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(format!("failed to read {}: {error}", path.display())),
        }

        if let Ok(value) = std::env::var("AGENT_SERVER") {
            if !value.trim().is_empty() {
                config.server_url = value.trim().to_owned();
            }
        }
        if let Ok(value) = std::env::var("AGENT_NAME") {
            if !value.trim().is_empty() {
                config.name = value.trim().to_owned();
            }
        }

        if config.name.is_empty() {
            config.name = sysinfo::System::host_name().unwrap_or_default();
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.trim().is_empty() {
            return Err("server_url is required (config.ini [agent] section)".to_owned());
        }
        if self.token.trim().is_empty() {
            return Err("token is required (config.ini [agent] section)".to_owned());
        }
        Ok(())
    }

    /// `http(s)://` base turned into the gateway websocket url.
    #[must_use]
    pub fn ws_url(&self, machine_id: &str) -> String {
        let base = self
            .server_url
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1);
        format!(
            "{}/api/agent/ws?token={}&machine_id={}",
            base.trim_end_matches('/'),
            urlencode(&self.token),
            urlencode(machine_id)
        )
    }
}

/// There is no ini crate in this stack; the format is three rules: section
/// headers, `key = value` pairs, `#`/`;` comments.
fn apply_ini(config: &mut AgentConfig, text: &str) {
    let mut in_agent_section = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
            in_agent_section = section.trim() == "agent";
            continue;
        }
        if !in_agent_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"');

        match key {
            "server_url" => config.server_url = value.to_owned(),
            "name" => config.name = value.to_owned(),
            "token" => config.token = value.to_owned(),
            "interval" => {
                if let Ok(secs) = value.parse::<u64>() {
                    if secs > 0 {
                        config.interval_secs = secs;
                    }
                }
            }
            "auto_update" => config.auto_update = value == "true" || value == "1",
            _ => {}
        }
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            other => {
                use std::fmt::Write;
                let _ = write!(out, "%{other:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{AgentConfig, apply_ini};

    #[test]
    fn ini_section_is_parsed_case_sensitively() {
        let mut config = AgentConfig::default();
        apply_ini(
            &mut config,
            "[agent]\nserver_url = http://127.0.0.1:18060\nname = worker-1\n\
             token = abc123\ninterval = 45\nauto_update = true\n",
        );
        assert_eq!(config.server_url, "http://127.0.0.1:18060");
        assert_eq!(config.name, "worker-1");
        assert_eq!(config.token, "abc123");
        assert_eq!(config.interval_secs, 45);
        assert!(config.auto_update);
    }

    #[test]
    fn other_sections_and_comments_are_ignored() {
        let mut config = AgentConfig::default();
        apply_ini(
            &mut config,
            "# comment\n[other]\ntoken = wrong\n[agent]\n; note\ntoken = right\n",
        );
        assert_eq!(config.token, "right");
        assert_eq!(config.interval_secs, 30);
    }

    #[test]
    fn bad_interval_keeps_the_default() {
        let mut config = AgentConfig::default();
        apply_ini(&mut config, "[agent]\ninterval = nope\n");
        assert_eq!(config.interval_secs, 30);
        apply_ini(&mut config, "[agent]\ninterval = 0\n");
        assert_eq!(config.interval_secs, 30);
    }

    #[test]
    fn ws_url_swaps_scheme_and_escapes_params() {
        let config = AgentConfig {
            server_url: "https://baihu.example.com/".to_owned(),
            token: "a b+c".to_owned(),
            ..AgentConfig::default()
        };
        let url = config.ws_url("mid01");
        assert_eq!(
            url,
            "wss://baihu.example.com/api/agent/ws?token=a%20b%2Bc&machine_id=mid01"
        );
    }
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;

const MAX_CONNECTIONS_PER_IP: u32 = 10;
const MIN_CONNECT_INTERVAL: Duration = Duration::from_secs(5);
const MAX_FAIL_COUNT: u32 = 5;
const FAIL_BLOCK_DURATION: Duration = Duration::from_secs(5 * 60);
const STALE_ENTRY_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Default)]
struct IpState {
    active_count: u32,
    last_attempt_ms: i64,
    fail_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    Allowed,
    /// Too many consecutive failures; carries the remaining block seconds.
    Blocked { retry_after_secs: u64 },
    TooFrequent,
    TooManyConnections,
}

impl ConnectDecision {
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Allowed => String::new(),
            Self::Blocked { retry_after_secs } => {
                format!("too many failed connections, retry in {retry_after_secs}s")
            }
            Self::TooFrequent => "connecting too frequently, retry shortly".to_owned(),
            Self::TooManyConnections => "connection limit reached for this address".to_owned(),
        }
    }
}

/// Per-source-ip admission control for the agent gateway. Every check is
/// an atomic read-modify-write of `{active_count, last_attempt, fail_count}`
/// under one lock.
#[derive(Debug, Clone)]
pub struct ConnectRateLimiter {
    state: Arc<Mutex<HashMap<String, IpState>>>,
}

impl Default for ConnectRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectRateLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn check(&self, ip: &str) -> ConnectDecision {
        let now = now_ms();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(ip.to_owned()).or_default();

        if entry.fail_count >= MAX_FAIL_COUNT {
            let since_last = now.saturating_sub(entry.last_attempt_ms);
            let block_ms = i64::try_from(FAIL_BLOCK_DURATION.as_millis()).unwrap_or(i64::MAX);
            if since_last < block_ms {
                let remaining_ms = block_ms.saturating_sub(since_last);
                return ConnectDecision::Blocked {
                    retry_after_secs: u64::try_from((remaining_ms + 999) / 1_000).unwrap_or(0),
                };
            }
            entry.fail_count = 0;
        }

        let min_interval_ms = i64::try_from(MIN_CONNECT_INTERVAL.as_millis()).unwrap_or(i64::MAX);
        if entry.last_attempt_ms > 0 && now.saturating_sub(entry.last_attempt_ms) < min_interval_ms
        {
            return ConnectDecision::TooFrequent;
        }

        if entry.active_count >= MAX_CONNECTIONS_PER_IP {
            return ConnectDecision::TooManyConnections;
        }

        entry.last_attempt_ms = now;
        ConnectDecision::Allowed
    }

    pub async fn record_fail(&self, ip: &str) {
        let mut guard = self.state.lock().await;
        let entry = guard.entry(ip.to_owned()).or_default();
        entry.fail_count = entry.fail_count.saturating_add(1);
        entry.last_attempt_ms = now_ms();
        if entry.fail_count >= MAX_FAIL_COUNT {
            tracing::warn!(
                "ip {ip} blocked after {} failed connects for {}s",
                entry.fail_count,
                FAIL_BLOCK_DURATION.as_secs()
            );
        }
    }

    pub async fn record_success(&self, ip: &str) {
        let mut guard = self.state.lock().await;
        let entry = guard.entry(ip.to_owned()).or_default();
        entry.fail_count = 0;
        entry.active_count = entry.active_count.saturating_add(1);
    }

    pub async fn release(&self, ip: &str) {
        let mut guard = self.state.lock().await;
        if let Some(entry) = guard.get_mut(ip) {
            entry.active_count = entry.active_count.saturating_sub(1);
        }
    }

    /// Drops entries idle longer than ten minutes with no live connection.
    pub async fn gc(&self) {
        let now = now_ms();
        let stale_ms = i64::try_from(STALE_ENTRY_AGE.as_millis()).unwrap_or(i64::MAX);
        let mut guard = self.state.lock().await;
        guard.retain(|_, entry| {
            entry.active_count > 0 || now.saturating_sub(entry.last_attempt_ms) <= stale_ms
        });
    }

    #[cfg(test)]
    pub(crate) async fn backdate_last_attempt(&self, ip: &str, by: Duration) {
        let mut guard = self.state.lock().await;
        if let Some(entry) = guard.get_mut(ip) {
            entry.last_attempt_ms -= i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        }
    }
}

fn now_ms() -> i64 {
    crate::storage::now_unix_ms()
}

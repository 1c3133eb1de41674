use thiserror::Error;

/// Why an enrollment token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailure {
    Unknown,
    Disabled,
    Exhausted,
    Expired,
}

impl TokenFailure {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Unknown => "unknown token",
            Self::Disabled => "token disabled",
            Self::Exhausted => "token exhausted",
            Self::Expired => "token expired",
        }
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("token rejected: {}", .0.message())]
    TokenRejected(TokenFailure),
    #[error("agent disabled")]
    AgentDisabled,
    #[error("rate limited: {reason}")]
    RateLimited { reason: String, retry_after_secs: u64 },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl DomainError {
    /// Status used when the error surfaces at the agent API boundary.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidSchedule(_) | Self::InvalidRequest(_) => 400,
            Self::TokenRejected(_) => 401,
            Self::AgentDisabled => 403,
            Self::NotFound(_) => 404,
            Self::RateLimited { .. } => 429,
            Self::Storage(_) | Self::Unavailable(_) => 503,
        }
    }
}

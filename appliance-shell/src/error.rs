use thiserror::Error;

/// Errors surfaced by the appliance shell client.
///
/// Shell command outcomes are classified here, at the parse boundary, into a
/// closed set of kinds. Callers match on kinds, never on message strings.
#[derive(Error, Debug)]
pub enum ShellError {
    #[error("disk entry not found: {0}")]
    NotFound(String),

    #[error("disk entry already exists: {0}")]
    AlreadyExists(String),

    #[error("storage pool out of space: {0}")]
    OutOfSpace(String),

    #[error("invalid identifier: {0}")]
    InvalidName(String),

    #[error("failed to parse appliance output: {0}")]
    Parse(String),

    #[error("appliance unreachable: {0}")]
    Unavailable(String),

    #[error("appliance authentication failed: {0}")]
    Unauthenticated(String),

    #[error("appliance circuit breaker open")]
    BreakerOpen,

    #[error("appliance command failed: {0}")]
    CommandFailed(String),
}

impl ShellError {
    /// Whether this error counts toward the session circuit breaker.
    ///
    /// Semantic outcomes (absent entry, duplicate entry, full pool) mean the
    /// session itself is healthy and must not trip the breaker.
    pub fn is_session_failure(&self) -> bool {
        matches!(
            self,
            ShellError::Unavailable(_) | ShellError::CommandFailed(_) | ShellError::Parse(_)
        )
    }

    /// Whether a retry of the same call may succeed without operator action.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ShellError::Unavailable(_) | ShellError::BreakerOpen)
    }
}

pub type Result<T> = std::result::Result<T, ShellError>;

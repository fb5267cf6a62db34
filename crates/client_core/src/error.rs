use thiserror::Error;

/// Failures surfaced by session operations.
///
/// None of these leave a half-applied transition behind: the session either
/// moves to its next state or keeps the one it had.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("action not allowed: {0}")]
    Precondition(String),
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend rejected request with status {status}: {message}")]
    Backend { status: u16, message: String },
    #[error("session storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SessionError {
    /// Whether repeating the same action unchanged could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Storage(_) => true,
            Self::Backend { status, .. } => *status >= 500 || *status == 429,
            Self::Validation(_) | Self::Precondition(_) => false,
        }
    }
}

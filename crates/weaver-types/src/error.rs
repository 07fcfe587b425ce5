use thiserror::Error;

/// The nine error kinds a caller of this workspace needs to distinguish.
///
/// `reason` codes are machine-readable (`"no-winner"`, `"path-escape"`, `"exit 2"`, …)
/// and are surfaced alongside the human message on every failing event.
#[derive(Debug, Error)]
pub enum WeaverError {
    #[error("validation error: {message}")]
    Validation { message: String, reason: Option<String> },

    #[error("state conflict: {message}")]
    StateConflict { message: String, reason: Option<String> },

    #[error("not runnable: {message}")]
    NotRunnable { message: String },

    #[error("provider error: {message}")]
    Provider { message: String, reason: Option<String> },

    #[error("red flag: {message}")]
    RedFlag { message: String, codes: Vec<String> },

    #[error("apply error: {message}")]
    Apply { message: String, reason: Option<String> },

    #[error("command error: {message}")]
    Command { message: String, reason: Option<String> },

    #[error("store error: {message}")]
    Store { message: String },

    #[error("cancelled: {message}")]
    Cancelled { message: String },
}

impl WeaverError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), reason: None }
    }

    pub fn validation_with_reason(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation { message: message.into(), reason: Some(reason.into()) }
    }

    pub fn state_conflict(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateConflict { message: message.into(), reason: Some(reason.into()) }
    }

    pub fn not_runnable(message: impl Into<String>) -> Self {
        Self::NotRunnable { message: message.into() }
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider { message: message.into(), reason: None }
    }

    pub fn apply(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Apply { message: message.into(), reason: Some(reason.into()) }
    }

    pub fn command(message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Command { message: message.into(), reason: Some(reason.into()) }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled { message: message.into() }
    }

    /// The machine-readable reason code, when this variant carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Validation { reason, .. }
            | Self::StateConflict { reason, .. }
            | Self::Provider { reason, .. }
            | Self::Apply { reason, .. }
            | Self::Command { reason, .. } => reason.as_deref(),
            Self::RedFlag { .. }
            | Self::NotRunnable { .. }
            | Self::Store { .. }
            | Self::Cancelled { .. } => None,
        }
    }
}

pub type WeaverResult<T> = Result<T, WeaverError>;

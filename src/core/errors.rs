// Error kinds for the session manager core.

use thiserror::Error;

/// Semantic error surface for every public entry point of the session
/// manager. Validation and security errors propagate to callers; transient
/// collaborator failures are logged and swallowed at the call site instead
/// of being wrapped here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    SecurityDenied(String),

    #[error("session manager is disposed")]
    Disposed,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type SessionResult<T> = Result<T, SessionError>;

impl SessionError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn denied(msg: impl Into<String>) -> Self {
        Self::SecurityDenied(msg.into())
    }
}

//! Error types for mailredo
//!
//! Defines a unified error type for the redo log, the shared store and the
//! distributed lock subsystem. Messages carry the same wording the mail
//! service reports to its callers.

use std::fmt;
use std::io;

/// Unified error type for mailredo operations
#[derive(Debug)]
pub enum RedoError {
    /// I/O error (log files, archive directory, scratch directories)
    Io(io::Error),
    /// Record could not be encoded or decoded
    Serialization(String),
    /// CommitId does not point into the retained redo log stream
    InvalidCommitId(String),
    /// Lock request rejected outright (e.g. too many waiters)
    LockFailed(String),
    /// Waited for a lock longer than the caller allowed
    LockTimeout(String),
    /// Lock state inconsistent with the request (releasing a lock not held)
    LockState(String),
    /// Shared store rejected a command or returned an unexpected reply
    Store(String),
    /// Invalid configuration
    Config(String),
    /// Operation refused because the component is shutting down
    ShuttingDown,
    /// Generic internal error
    Internal(String),
}

impl RedoError {
    /// "invalid commit id" condition for a stale or unknown CommitId
    pub fn invalid_commit_id(commit_id: impl fmt::Display) -> Self {
        RedoError::InvalidCommitId(format!("invalid commit id: {}", commit_id))
    }

    /// "lock failed" condition
    pub fn lock_failed(reason: &str) -> Self {
        RedoError::LockFailed(format!("lock failed: {}", reason))
    }

    /// Create an error for a reply shape a script was not expected to return
    pub fn unexpected_reply(script: &str, reply: impl fmt::Debug) -> Self {
        RedoError::Store(format!("unexpected reply from {}: {:?}", script, reply))
    }

    /// True for errors that callers may retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, RedoError::LockFailed(_) | RedoError::LockTimeout(_))
    }
}

impl fmt::Display for RedoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RedoError::Io(e) => write!(f, "{}", e),
            RedoError::Serialization(msg) => write!(f, "serialization error: {}", msg),
            RedoError::InvalidCommitId(msg) => write!(f, "{}", msg),
            RedoError::LockFailed(msg) => write!(f, "{}", msg),
            RedoError::LockTimeout(msg) => write!(f, "{}", msg),
            RedoError::LockState(msg) => write!(f, "{}", msg),
            RedoError::Store(msg) => write!(f, "{}", msg),
            RedoError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            RedoError::ShuttingDown => write!(f, "shutting down"),
            RedoError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RedoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RedoError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RedoError {
    fn from(e: io::Error) -> Self {
        RedoError::Io(e)
    }
}

impl From<bincode::Error> for RedoError {
    fn from(e: bincode::Error) -> Self {
        RedoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RedoError {
    fn from(e: serde_json::Error) -> Self {
        RedoError::Config(e.to_string())
    }
}

/// Result type alias for mailredo operations
pub type Result<T> = std::result::Result<T, RedoError>;

/// Mail service error codes (the subset surfaced by this crate)
pub mod service_error_codes {
    pub const INVALID_COMMIT_ID: &str = "mail.INVALID_COMMIT_ID";
    pub const LOCK_FAILED: &str = "service.LOCK_FAILED";
    pub const LOCK_TIMEOUT: &str = "service.LOCK_TIMEOUT";
    pub const SHUTTING_DOWN: &str = "service.SHUTTING_DOWN";
    pub const FAILURE: &str = "service.FAILURE";
}

impl RedoError {
    /// Get the mail service error code for this error
    pub fn service_code(&self) -> &'static str {
        match self {
            RedoError::InvalidCommitId(_) => service_error_codes::INVALID_COMMIT_ID,
            RedoError::LockFailed(_) => service_error_codes::LOCK_FAILED,
            RedoError::LockTimeout(_) => service_error_codes::LOCK_TIMEOUT,
            RedoError::ShuttingDown => service_error_codes::SHUTTING_DOWN,
            _ => service_error_codes::FAILURE,
        }
    }
}

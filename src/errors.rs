//! Error types shared across the runtime.

use std::fmt::{Display, Formatter};

/// Shared runtime result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Runtime error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure other than reachability (constraint, decode, query).
    Db(String),
    /// Persistence layer unreachable; fatal for the current execution attempt.
    StoreUnavailable(String),
    /// Requested session or record does not exist.
    NotFound(String),
    /// Decision submitted while the session is not waiting for approval.
    NoPendingApproval(String),
    /// A decision was already accepted for the pending-approval marker.
    AlreadyDecided(String),
    /// Session status transition rejected by the lifecycle state machine.
    InvalidTransition(String),
    /// Agent or tool logic raised an unrecoverable fault.
    ExecutionFailed(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error belongs to the caller-error class (surfaced, never retried).
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NoPendingApproval(_) | Self::AlreadyDecided(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::NoPendingApproval(msg) => write!(f, "no pending approval: {msg}"),
            Self::AlreadyDecided(msg) => write!(f, "already decided: {msg}"),
            Self::InvalidTransition(msg) => write!(f, "invalid transition: {msg}"),
            Self::ExecutionFailed(msg) => write!(f, "execution failed: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed => Self::StoreUnavailable(err.to_string()),
            other => Self::Db(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Db(format!("payload encoding: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

//! Error types shared across the engine.

use std::fmt::{Display, Formatter};

/// Shared engine result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Engine error enumeration covering all non-retryable failure modes.
///
/// Transient executor failures are not errors at this level: they are
/// classified into an [`ErrorClass`](crate::models::outcome::ErrorClass)
/// and handled by the retry policy inside the scheduler loop.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Job store missing, unreadable, or internally inconsistent.
    Store(String),
    /// A mutation would break a job or queue invariant.
    InvariantViolation(String),
    /// Inbox processing failed; the inbox artifact is left for retry.
    Merge(String),
    /// Executor process could not be spawned or awaited.
    Executor(String),
    /// Session registry bookkeeping or orphan termination failure.
    Registry(String),
    /// IPC communication failure.
    Ipc(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error must abort the engine before further iterations.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Store(_) | Self::InvariantViolation(_) | Self::Io(_)
        )
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Store(msg) => write!(f, "store: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::Merge(msg) => write!(f, "merge failure: {msg}"),
            Self::Executor(msg) => write!(f, "executor: {msg}"),
            Self::Registry(msg) => write!(f, "registry: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
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

//! Error types for Autogit

use thiserror::Error;

/// Result type alias for Autogit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Autogit operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Git error from libgit2
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// File watching error
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A request could not be constructed (missing destination, bad names, ...)
    #[error("Setup error: {0}")]
    Setup(String),

    /// The manager's queues have been closed
    #[error("Autogit manager is shutting down")]
    ShuttingDown,

    /// A blocking job panicked or was cancelled
    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

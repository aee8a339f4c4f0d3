//! Common error types for treesync.

use thiserror::Error;

/// Top-level error type for treesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Data shape does not match the declared transform or tracking spec.
    #[error("Transform mismatch: {0}")]
    TransformMismatch(String),

    /// A transform or tracking spec could not be parsed.
    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    /// The remote backend rejected a batch write.
    #[error("Remote write failed: {0}")]
    RemoteWrite(String),

    /// Transient network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote operation attempted without an authenticated session.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Local durable store failed to read or write.
    #[error("Local store error: {0}")]
    LocalStore(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The persistence engine task is no longer running.
    #[error("Engine stopped: {0}")]
    EngineStopped(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

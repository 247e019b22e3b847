//! Error types for decompose-runtime.

use thiserror::Error;

/// Result type alias for decompose-runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors that can occur during container runtime operations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A container with the requested name already exists
    #[error("container name already in use: {0}")]
    NameConflict(String),

    /// Container or image does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation refused because of a conflicting state (e.g. image in use)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Image build reported an error
    #[error("image build failed: {0}")]
    Build(String),

    /// Build context could not be packaged
    #[error("invalid build context: {0}")]
    Context(String),

    /// Runtime did not answer in time
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Runtime endpoint unreachable
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    /// Docker API error
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Check if this error means the target does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Check if this error is a container name collision.
    pub fn is_name_conflict(&self) -> bool {
        matches!(self, RuntimeError::NameConflict(_))
    }
}

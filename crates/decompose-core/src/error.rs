//! Error types for decompose-core.

use crate::job::JobId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for decompose-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while queueing or orchestrating jobs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Image build failed or timed out; no container was created
    #[error("build failed for {name}: {reason}")]
    BuildFailed { name: String, reason: String },

    /// Container could not be started (name collisions are not reported here)
    #[error("run failed for {name}: {reason}")]
    RunFailed { name: String, reason: String },

    /// Container removal failed or timed out
    #[error("teardown failed for {name}: {reason}")]
    TeardownFailed { name: String, reason: String },

    /// Queue is at capacity; the caller must back off
    #[error("queue saturated (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    /// Queue no longer accepts jobs
    #[error("queue is closed")]
    QueueClosed,

    /// Job finished at the runtime level but its completion was never recorded
    #[error("job {job_id} completed but recording failed after {attempts} attempts: {reason}")]
    OrchestrationIncomplete {
        job_id: JobId,
        attempts: u32,
        reason: String,
    },

    /// Unknown logical name or job id
    #[error("not found: {0}")]
    NotFound(String),

    /// Name cannot be used as a container identity
    #[error("invalid container name: {0:?}")]
    InvalidName(String),

    /// Build target registry could not be read
    #[error("registry error: {0}")]
    Registry(String),

    /// Configuration is invalid
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Completion sink rejected a record
    #[error("completion sink error: {0}")]
    Sink(String),

    /// Error from decompose-runtime
    #[error("runtime error: {0}")]
    Runtime(#[from] decompose_runtime::RuntimeError),
}

impl CoreError {
    /// Classify this error for job records.
    pub fn kind(&self) -> FailureKind {
        match self {
            CoreError::BuildFailed { .. } => FailureKind::BuildFailed,
            CoreError::RunFailed { .. } => FailureKind::RunFailed,
            CoreError::TeardownFailed { .. } => FailureKind::TeardownFailed,
            CoreError::QueueSaturated { .. } | CoreError::QueueClosed => {
                FailureKind::QueueSaturated
            }
            CoreError::OrchestrationIncomplete { .. } | CoreError::Sink(_) => {
                FailureKind::OrchestrationIncomplete
            }
            CoreError::NotFound(_) => FailureKind::NotFound,
            CoreError::InvalidName(_) | CoreError::Config(_) => FailureKind::InvalidInput,
            CoreError::Registry(_) | CoreError::Runtime(_) => FailureKind::Runtime,
        }
    }
}

/// Serializable classification attached to failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    BuildFailed,
    RunFailed,
    TeardownFailed,
    QueueSaturated,
    OrchestrationIncomplete,
    NotFound,
    InvalidInput,
    Runtime,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuildFailed => "build_failed",
            Self::RunFailed => "run_failed",
            Self::TeardownFailed => "teardown_failed",
            Self::QueueSaturated => "queue_saturated",
            Self::OrchestrationIncomplete => "orchestration_incomplete",
            Self::NotFound => "not_found",
            Self::InvalidInput => "invalid_input",
            Self::Runtime => "runtime",
        };
        write!(f, "{s}")
    }
}

//! Job model shared by producers, the queue and workers.

use crate::error::{CoreError, FailureKind};
use crate::orchestrator::{LaunchOutcome, TeardownReport};
use chrono::{DateTime, Utc};
use decompose_runtime::BuildContextRef;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    BuildAndRun,
    KillAndClean,
    RecordEvent,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildAndRun => write!(f, "build_and_run"),
            Self::KillAndClean => write!(f, "kill_and_clean"),
            Self::RecordEvent => write!(f, "record_event"),
        }
    }
}

/// Kind-specific job arguments.
///
/// Serialized with a `kind` tag, e.g.
/// `{"kind":"build_and_run","name":"scan-a","context":"/targets/scan-a"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobSpec {
    /// Build an image from `context` and run it as container `name`.
    BuildAndRun {
        name: String,
        context: BuildContextRef,
    },
    /// Remove every managed container named `name` and its image.
    KillAndClean { name: String },
    /// Record a free-form event through the completion sink.
    RecordEvent { message: String },
}

impl JobSpec {
    /// Get the job kind.
    pub fn kind(&self) -> JobKind {
        match self {
            Self::BuildAndRun { .. } => JobKind::BuildAndRun,
            Self::KillAndClean { .. } => JobKind::KillAndClean,
            Self::RecordEvent { .. } => JobKind::RecordEvent,
        }
    }

    /// Logical container name the job targets, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::BuildAndRun { name, .. } | Self::KillAndClean { name } => Some(name),
            Self::RecordEvent { .. } => None,
        }
    }
}

/// Lifecycle status of a job. `Succeeded` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work travelling through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub submitted_at: DateTime<Utc>,
    /// Number of times the job has been delivered to a worker.
    pub attempts: u32,
}

impl Job {
    /// Create a job with a fresh id.
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            spec,
            submitted_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Get the job kind.
    pub fn kind(&self) -> JobKind {
        self.spec.kind()
    }
}

/// Successful result of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Launched(LaunchOutcome),
    TornDown(TeardownReport),
    EventRecorded,
}

impl JobOutcome {
    /// Container id produced or found by a launch.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::Launched(launch) => Some(launch.container_id()),
            _ => None,
        }
    }
}

/// Classified failure attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&CoreError> for JobError {
    fn from(err: &CoreError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Completion fact handed to the completion sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job_id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub name: Option<String>,
    pub container_id: Option<String>,
    /// Event message, or the error message of a failed job.
    pub detail: Option<String>,
    pub failure: Option<FailureKind>,
    pub finished_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Build the completion fact for a finished job.
    pub fn new(job: &Job, result: &Result<JobOutcome, CoreError>) -> Self {
        match result {
            Ok(outcome) => Self::succeeded(job, outcome),
            Err(e) => Self::failed(job, &JobError::from(e)),
        }
    }

    pub fn succeeded(job: &Job, outcome: &JobOutcome) -> Self {
        let detail = match &job.spec {
            JobSpec::RecordEvent { message } => Some(message.clone()),
            _ => None,
        };
        Self {
            job_id: job.id,
            kind: job.kind(),
            status: JobStatus::Succeeded,
            name: job.spec.name().map(str::to_string),
            container_id: outcome.container_id().map(str::to_string),
            detail,
            failure: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(job: &Job, error: &JobError) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind(),
            status: JobStatus::Failed,
            name: job.spec.name().map(str::to_string),
            container_id: None,
            detail: Some(error.message.clone()),
            failure: Some(error.kind),
            finished_at: Utc::now(),
        }
    }
}

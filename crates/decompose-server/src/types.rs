//! Request and response bodies for the HTTP API.

use decompose_core::{BuildTarget, FailureKind, JobId, JobStatus, WorkerStatsSnapshot};
use decompose_runtime::BuildContextRef;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /containers/{name}/start`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    /// Build context. Resolved through the target registry when omitted.
    #[serde(default)]
    pub context: Option<BuildContextRef>,
}

/// Body of `POST /containers/start-all`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartAllRequest {
    /// Explicit targets. Every registry target when omitted.
    #[serde(default)]
    pub targets: Option<Vec<BuildTarget>>,
}

/// Query string of the bulk routes.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BulkParams {
    /// Run the batch in the request instead of enqueueing one job per item.
    #[serde(default)]
    pub sync: bool,
}

/// Query string of `GET /jobs/{id}`.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct JobQuery {
    /// Wait up to this many seconds for the job to finish.
    #[serde(default)]
    pub wait_secs: Option<u64>,
}

/// Body of `POST /events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventRequest {
    pub message: String,
}

// ============================================================================
// Responses
// ============================================================================

/// A job was accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
}

/// One item of a bulk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItem {
    /// Logical container name.
    pub name: String,
    /// Job handling this item, if it was accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Why the item was not accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a bulk submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSubmitResponse {
    pub jobs: Vec<BulkItem>,
}

/// Health and load summary.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub workers: WorkerStatsSnapshot,
    pub jobs: HashMap<JobStatus, usize>,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: FailureKind,
}

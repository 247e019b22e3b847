//! Shared handles for the HTTP handlers.

use decompose_core::{JobId, JobQueue, JobSpec, JobTracker, Orchestrator, Result, WorkerStats};
use std::sync::Arc;

/// State cloned into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<dyn JobQueue>,
    pub tracker: Arc<JobTracker>,
    pub stats: Arc<WorkerStats>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        queue: Arc<dyn JobQueue>,
        tracker: Arc<JobTracker>,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            orchestrator,
            queue,
            tracker,
            stats,
        }
    }

    /// Track and enqueue a job.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId> {
        self.tracker.submit(self.queue.as_ref(), spec).await
    }
}

//! In-memory job status tracking.

use crate::error::{CoreError, Result};
use crate::job::{Job, JobError, JobId, JobKind, JobOutcome, JobSpec, JobStatus};
use crate::queue::JobQueue;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

/// Default number of records kept before finished ones are evicted.
const DEFAULT_RETENTION: usize = 10_000;

/// Everything known about one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: JobKind,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobError>,
    /// Whether the completion sink acknowledged the job.
    pub recorded: bool,
    /// `OrchestrationIncomplete` failure when the sink never acknowledged.
    pub record_error: Option<JobError>,
}

impl JobRecord {
    fn new(job: &Job) -> Self {
        Self {
            id: job.id,
            kind: job.kind(),
            spec: job.spec.clone(),
            status: JobStatus::Queued,
            submitted_at: job.submitted_at,
            started_at: None,
            finished_at: None,
            attempts: job.attempts,
            outcome: None,
            error: None,
            recorded: false,
            record_error: None,
        }
    }

    /// Terminal and acknowledged by the sink.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.recorded
    }
}

/// Status board for submitted jobs.
///
/// Records are mutated by the worker that holds the job. Settled records
/// are evicted oldest-first once the retention limit is exceeded.
pub struct JobTracker {
    records: RwLock<HashMap<JobId, JobRecord>>,
    finished: Notify,
    retention: usize,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a tracker that keeps at most `retention` records when it can.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            finished: Notify::new(),
            retention: retention.max(1),
        }
    }

    /// Track a job and enqueue it. The record is dropped if the queue
    /// refuses the job.
    pub async fn submit(&self, queue: &dyn JobQueue, spec: JobSpec) -> Result<JobId> {
        let job = Job::new(spec);
        let id = job.id;
        self.insert(&job);

        if let Err(e) = queue.submit(job).await {
            self.records.write().remove(&id);
            return Err(e);
        }
        tracing::info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    /// Start tracking a job in the `Queued` state.
    pub fn insert(&self, job: &Job) {
        let mut records = self.records.write();
        records.insert(job.id, JobRecord::new(job));
        if records.len() > self.retention {
            Self::evict(&mut records, self.retention);
        }
    }

    fn evict(records: &mut HashMap<JobId, JobRecord>, retention: usize) {
        let mut settled: Vec<(DateTime<Utc>, JobId)> = records
            .values()
            .filter(|r| r.is_settled())
            .map(|r| (r.finished_at.unwrap_or(r.submitted_at), r.id))
            .collect();
        settled.sort();

        let excess = records.len().saturating_sub(retention);
        for (_, id) in settled.into_iter().take(excess) {
            records.remove(&id);
        }
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.records.read().get(id).cloned()
    }

    /// Mark a delivered job as running. Returns `false` if the job already
    /// reached a terminal state (a redelivery) or is unknown.
    pub fn mark_running(&self, job: &Job) -> bool {
        let mut records = self.records.write();
        let record = records
            .entry(job.id)
            .or_insert_with(|| JobRecord::new(job));
        if record.status.is_terminal() {
            return false;
        }
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        record.attempts = job.attempts;
        true
    }

    /// Store the result of a job and move it to its terminal state.
    pub fn mark_finished(&self, id: &JobId, result: &std::result::Result<JobOutcome, CoreError>) {
        {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(id) else {
                return;
            };
            record.finished_at = Some(Utc::now());
            match result {
                Ok(outcome) => {
                    record.status = JobStatus::Succeeded;
                    record.outcome = Some(outcome.clone());
                }
                Err(e) => {
                    record.status = JobStatus::Failed;
                    record.error = Some(JobError::from(e));
                }
            }
        }
        self.finished.notify_waiters();
    }

    /// The completion sink acknowledged the job.
    pub fn mark_recorded(&self, id: &JobId) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.recorded = true;
            record.record_error = None;
        }
    }

    /// The completion sink never acknowledged the job. The terminal status
    /// and job error are kept.
    pub fn mark_incomplete(&self, id: &JobId, err: &CoreError) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.recorded = false;
            record.record_error = Some(JobError::from(err));
        }
    }

    /// Wait until the job is terminal or `timeout` elapses.
    ///
    /// Returns the latest record either way, or `None` for unknown ids.
    pub async fn wait_for(&self, id: &JobId, timeout: Duration) -> Option<JobRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.get(id)?;
            if record.status.is_terminal() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(id);
            }
        }
    }

    /// Count records per status.
    pub fn counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.records.read().values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

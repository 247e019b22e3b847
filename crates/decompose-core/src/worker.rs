//! Worker pool executing queued jobs against the orchestrator.
//!
//! Each worker loops: dequeue, mark running, dispatch on the job spec,
//! mark the terminal status, hand the completion record to the sink (with
//! bounded backoff), acknowledge. A record the sink never accepts leaves the
//! job visible as `OrchestrationIncomplete` in the tracker.
//!
//! # Example
//!
//! ```ignore
//! let mut pool = WorkerPool::new(queue, orchestrator, tracker, sink, WorkerConfig::default());
//! pool.start();
//! // ...
//! pool.shutdown().await?;
//! ```

use crate::config::RetryPolicy;
use crate::error::Result;
use crate::job::{CompletionRecord, Job, JobOutcome, JobSpec};
use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::sink::{record_with_retry, CompletionSink};
use crate::tracker::JobTracker;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    ///
    /// Default: 4
    pub workers: usize,

    /// Interval between expired-lease sweeps.
    ///
    /// Default: 30 seconds
    pub reap_interval: Duration,

    /// How long shutdown waits for workers to drain the queue before
    /// aborting them.
    ///
    /// Default: 60 seconds
    pub shutdown_timeout: Duration,

    /// Backoff for recording completions.
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            reap_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Worker statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Jobs taken off the queue.
    pub processed: AtomicU64,
    /// Jobs that ended `Succeeded`.
    pub succeeded: AtomicU64,
    /// Jobs that ended `Failed`.
    pub failed: AtomicU64,
    /// Jobs whose completion was never recorded.
    pub incomplete: AtomicU64,
    /// Deliveries skipped because the job was already terminal.
    pub redelivered: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub incomplete: u64,
    pub redelivered: u64,
}

impl WorkerStats {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn incomplete(&self) -> u64 {
        self.incomplete.load(Ordering::Relaxed)
    }

    pub fn redelivered(&self) -> u64 {
        self.redelivered.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            incomplete: self.incomplete(),
            redelivered: self.redelivered(),
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

/// State shared by every worker task.
struct Worker {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    tracker: Arc<JobTracker>,
    sink: Arc<dyn CompletionSink>,
    retry: RetryPolicy,
    stats: Arc<WorkerStats>,
}

impl Worker {
    async fn run(self: Arc<Self>, index: usize) {
        tracing::debug!(worker = index, "Worker started");
        while let Some(job) = self.queue.dequeue().await {
            self.process(index, job).await;
        }
        tracing::debug!(worker = index, "Worker exited");
    }

    async fn process(&self, index: usize, job: Job) {
        self.stats.processed.fetch_add(1, Ordering::Relaxed);

        if !self.tracker.mark_running(&job) {
            self.settle_redelivery(&job).await;
            return;
        }

        let kind = job.kind();
        tracing::info!(worker = index, job_id = %job.id, kind = %kind, attempt = job.attempts, "Job started");

        let result = self.execute(&job.spec).await;
        match &result {
            Ok(_) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(worker = index, job_id = %job.id, kind = %kind, "Job succeeded");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(worker = index, job_id = %job.id, kind = %kind, error = %e, "Job failed");
            }
        }

        let record = CompletionRecord::new(&job, &result);
        self.tracker.mark_finished(&job.id, &result);
        self.record(&record).await;
        self.queue.ack(&job.id).await;
    }

    async fn execute(&self, spec: &JobSpec) -> Result<JobOutcome> {
        match spec {
            JobSpec::BuildAndRun { name, context } => self
                .orchestrator
                .build_and_run(name, context)
                .await
                .map(JobOutcome::Launched),
            JobSpec::KillAndClean { name } => self
                .orchestrator
                .kill_and_clean(name)
                .await
                .map(JobOutcome::TornDown),
            JobSpec::RecordEvent { message } => {
                tracing::info!(message = %message, "Event recorded");
                Ok(JobOutcome::EventRecorded)
            }
        }
    }

    async fn record(&self, record: &CompletionRecord) {
        match record_with_retry(self.sink.as_ref(), record, &self.retry).await {
            Ok(_) => self.tracker.mark_recorded(&record.job_id),
            Err(e) => {
                self.stats.incomplete.fetch_add(1, Ordering::Relaxed);
                tracing::error!(job_id = %record.job_id, error = %e, "Job completion was not recorded");
                self.tracker.mark_incomplete(&record.job_id, &e);
            }
        }
    }

    /// A redelivered job that already finished: only make sure its
    /// completion is recorded.
    async fn settle_redelivery(&self, job: &Job) {
        self.stats.redelivered.fetch_add(1, Ordering::Relaxed);
        tracing::info!(job_id = %job.id, attempt = job.attempts, "Skipping redelivered job that already finished");

        if let Some(existing) = self.tracker.get(&job.id) {
            if !existing.recorded {
                let record = match (&existing.outcome, &existing.error) {
                    (Some(outcome), _) => Some(CompletionRecord::succeeded(job, outcome)),
                    (None, Some(error)) => Some(CompletionRecord::failed(job, error)),
                    (None, None) => None,
                };
                if let Some(mut record) = record {
                    if let Some(finished_at) = existing.finished_at {
                        record.finished_at = finished_at;
                    }
                    self.record(&record).await;
                }
            }
        }
        self.queue.ack(&job.id).await;
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Fixed-size pool of worker tasks plus a lease reaper.
pub struct WorkerPool {
    worker: Arc<Worker>,
    config: WorkerConfig,
    /// Shutdown signal for the reaper task.
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
    reaper_handle: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool. Workers are not started until [`start()`](Self::start).
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        tracker: Arc<JobTracker>,
        sink: Arc<dyn CompletionSink>,
        config: WorkerConfig,
    ) -> Self {
        tracing::info!(workers = config.workers, "Creating worker pool");
        Self {
            worker: Arc::new(Worker {
                queue,
                orchestrator,
                tracker,
                sink,
                retry: config.retry.clone(),
                stats: Arc::new(WorkerStats::default()),
            }),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            handles: Vec::new(),
            reaper_handle: None,
        }
    }

    /// Spawn the workers and the lease reaper.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            tracing::warn!("Worker pool already started");
            return;
        }

        for index in 0..self.config.workers.max(1) {
            let worker = Arc::clone(&self.worker);
            self.handles.push(tokio::spawn(worker.run(index)));
        }

        let queue = Arc::clone(&self.worker.queue);
        let shutdown = Arc::clone(&self.shutdown);
        let shutdown_notify = Arc::clone(&self.shutdown_notify);
        let interval = self.config.reap_interval;
        self.reaper_handle = Some(tokio::spawn(async move {
            Self::reaper_loop(queue, interval, shutdown, shutdown_notify).await;
        }));

        tracing::info!(workers = self.handles.len(), "Worker pool started");
    }

    /// Periodically return expired leases to the queue.
    async fn reaper_loop(
        queue: Arc<dyn JobQueue>,
        interval: Duration,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_notify.notified() => {
                    tracing::debug!("Lease reaper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let reclaimed = queue.reclaim_expired().await;
                    if reclaimed > 0 {
                        tracing::warn!(reclaimed, "Redelivering jobs with expired leases");
                    }
                }
            }
        }
    }

    /// Get the pool statistics.
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.worker.stats)
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Check if workers are running.
    pub fn is_running(&self) -> bool {
        !self.handles.is_empty() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Gracefully shutdown the pool.
    ///
    /// This:
    /// 1. Closes the queue so no new jobs are accepted
    /// 2. Lets workers finish in-flight and already queued jobs
    /// 3. Aborts workers still busy after `shutdown_timeout`
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down worker pool");

        self.shutdown.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_one();
        self.worker.queue.close();

        if let Some(handle) = self.reaper_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = ?e, "Lease reaper panicked during shutdown");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        let mut aborted = 0;
        for mut handle in self.handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = ?e, "Worker panicked during shutdown"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Aborted workers that did not finish in time");
        }

        let stats = self.worker.stats.snapshot();
        tracing::info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            incomplete = stats.incomplete,
            "Worker pool shutdown complete"
        );
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

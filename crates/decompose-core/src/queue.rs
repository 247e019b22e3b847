//! Job queue abstraction and the bounded in-memory implementation.
//!
//! Delivery is at-least-once: [`JobQueue::dequeue`] hands out a *lease*
//! that stays open until [`JobQueue::ack`]. Leases older than the lease
//! timeout are returned to the ready queue by [`JobQueue::reclaim_expired`],
//! so a job whose worker died is delivered again.

use crate::error::{CoreError, Result};
use crate::job::{Job, JobId};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`MemoryQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum outstanding jobs (ready + leased).
    ///
    /// Default: 1024
    pub capacity: usize,

    /// How long a delivered job may stay unacknowledged before it is
    /// redelivered.
    ///
    /// Default: 15 minutes
    pub lease_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            lease_timeout: Duration::from_secs(900),
        }
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Durable-ish FIFO of jobs consumed by the worker pool.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. Fails with `QueueSaturated` when full and
    /// `QueueClosed` after [`close`](Self::close).
    async fn submit(&self, job: Job) -> Result<JobId>;

    /// Wait for the next ready job and lease it.
    ///
    /// Returns `None` once the queue is closed and no ready job remains.
    async fn dequeue(&self) -> Option<Job>;

    /// Acknowledge a delivered job. Returns `false` if no lease was open.
    async fn ack(&self, id: &JobId) -> bool;

    /// Return expired leases to the ready queue. Returns how many.
    async fn reclaim_expired(&self) -> usize;

    /// Stop accepting jobs and wake idle consumers.
    fn close(&self);

    /// Whether [`close`](Self::close) has been called.
    fn is_closed(&self) -> bool;

    /// Number of jobs waiting to be delivered.
    async fn depth(&self) -> usize;

    /// Number of delivered, unacknowledged jobs.
    async fn in_flight(&self) -> usize;
}

// ============================================================================
// In-memory implementation
// ============================================================================

struct Lease {
    job: Job,
    leased_at: Instant,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Job>,
    leased: HashMap<JobId, Lease>,
}

/// Bounded in-process queue.
///
/// Waiting consumers are woken in arrival order through a [`Notify`].
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    closed: AtomicBool,
    config: QueueConfig,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        tracing::debug!(
            capacity = config.capacity,
            lease_timeout_secs = config.lease_timeout.as_secs(),
            "Creating memory queue"
        );
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn submit(&self, job: Job) -> Result<JobId> {
        if self.is_closed() {
            return Err(CoreError::QueueClosed);
        }

        let id = job.id;
        {
            let mut inner = self.inner.lock().await;
            if inner.ready.len() + inner.leased.len() >= self.config.capacity {
                tracing::warn!(
                    job_id = %id,
                    capacity = self.config.capacity,
                    "Queue saturated, rejecting job"
                );
                return Err(CoreError::QueueSaturated {
                    capacity: self.config.capacity,
                });
            }
            inner.ready.push_back(job);
        }

        self.notify.notify_one();
        tracing::debug!(job_id = %id, "Job enqueued");
        Ok(id)
    }

    async fn dequeue(&self) -> Option<Job> {
        loop {
            // Register interest before checking state so a submit between
            // the check and the await is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().await;
                if let Some(mut job) = inner.ready.pop_front() {
                    job.attempts += 1;
                    inner.leased.insert(
                        job.id,
                        Lease {
                            job: job.clone(),
                            leased_at: Instant::now(),
                        },
                    );
                    let more = !inner.ready.is_empty();
                    drop(inner);

                    // Pass a pending wakeup on to the next idle consumer.
                    if more {
                        self.notify.notify_one();
                    }
                    tracing::trace!(job_id = %job.id, attempt = job.attempts, "Job leased");
                    return Some(job);
                }
                if self.is_closed() {
                    return None;
                }
            }

            notified.await;
        }
    }

    async fn ack(&self, id: &JobId) -> bool {
        let acked = self.inner.lock().await.leased.remove(id).is_some();
        if !acked {
            tracing::debug!(job_id = %id, "Ack for job without an open lease");
        }
        acked
    }

    async fn reclaim_expired(&self) -> usize {
        let reclaimed = {
            let mut inner = self.inner.lock().await;
            let expired: Vec<JobId> = inner
                .leased
                .iter()
                .filter(|(_, lease)| lease.leased_at.elapsed() >= self.config.lease_timeout)
                .map(|(id, _)| *id)
                .collect();

            for id in &expired {
                if let Some(lease) = inner.leased.remove(id) {
                    tracing::warn!(
                        job_id = %id,
                        attempt = lease.job.attempts,
                        "Lease expired, redelivering job"
                    );
                    inner.ready.push_front(lease.job);
                }
            }
            expired.len()
        };

        for _ in 0..reclaimed {
            self.notify.notify_one();
        }
        reclaimed
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("Job queue closed");
        }
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn depth(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    async fn in_flight(&self) -> usize {
        self.inner.lock().await.leased.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;
    use std::sync::Arc;

    fn event(message: &str) -> Job {
        Job::new(JobSpec::RecordEvent {
            message: message.into(),
        })
    }

    fn message(job: &Job) -> &str {
        match &job.spec {
            JobSpec::RecordEvent { message } => message,
            _ => panic!("unexpected job spec"),
        }
    }

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.lease_timeout, Duration::from_secs(900));
    }

    #[tokio::test]
    async fn test_fifo_per_producer() {
        let queue = MemoryQueue::default();
        for i in 0..5 {
            queue.submit(event(&format!("m{i}"))).await.unwrap();
        }
        for i in 0..5 {
            let job = queue.dequeue().await.unwrap();
            assert_eq!(message(&job), format!("m{i}"));
            assert_eq!(job.attempts, 1);
        }
    }

    #[tokio::test]
    async fn test_saturation() {
        let queue = MemoryQueue::new(QueueConfig {
            capacity: 2,
            ..Default::default()
        });
        queue.submit(event("a")).await.unwrap();
        queue.submit(event("b")).await.unwrap();
        let err = queue.submit(event("c")).await.unwrap_err();
        assert!(matches!(err, CoreError::QueueSaturated { capacity: 2 }));

        // Leased jobs still count until acknowledged.
        let job = queue.dequeue().await.unwrap();
        assert!(queue.submit(event("c")).await.is_err());
        assert!(queue.ack(&job.id).await);
        queue.submit(event("c")).await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_and_counters() {
        let queue = MemoryQueue::default();
        queue.submit(event("a")).await.unwrap();
        assert_eq!(queue.depth().await, 1);
        assert_eq!(queue.in_flight().await, 0);

        let job = queue.dequeue().await.unwrap();
        assert_eq!(queue.depth().await, 0);
        assert_eq!(queue.in_flight().await, 1);

        assert!(queue.ack(&job.id).await);
        assert!(!queue.ack(&job.id).await);
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_submit() {
        let queue = Arc::new(MemoryQueue::default());
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue().await })
        };

        tokio::task::yield_now().await;
        queue.submit(event("late")).await.unwrap();

        let job = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message(&job), "late");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = Arc::new(MemoryQueue::default());
        queue.submit(event("left")).await.unwrap();
        queue.close();

        assert!(matches!(
            queue.submit(event("rejected")).await,
            Err(CoreError::QueueClosed)
        ));
        assert!(queue.dequeue().await.is_some());
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_idle_consumers() {
        let queue = Arc::new(MemoryQueue::default());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.dequeue().await })
            })
            .collect();

        tokio::task::yield_now().await;
        queue.close();

        for consumer in consumers {
            let result = tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .unwrap()
                .unwrap();
            assert!(result.is_none());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new(QueueConfig {
            capacity: 8,
            lease_timeout: Duration::from_secs(10),
        });
        let id = queue.submit(event("crashy")).await.unwrap();
        let first = queue.dequeue().await.unwrap();
        assert_eq!(first.id, id);

        assert_eq!(queue.reclaim_expired().await, 0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(queue.reclaim_expired().await, 1);
        assert_eq!(queue.in_flight().await, 0);

        let again = queue.dequeue().await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.attempts, 2);
    }
}

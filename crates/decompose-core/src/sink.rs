//! Completion sink: append-only store for job completion facts.

use crate::config::RetryPolicy;
use crate::error::{CoreError, Result};
use crate::job::{CompletionRecord, JobId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Append-only destination for [`CompletionRecord`]s.
///
/// Implementations must be safe for concurrent writers and must ignore
/// a record whose job id was already stored.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Store a record. Returns `false` if the job id was already present.
    async fn record(&self, record: &CompletionRecord) -> Result<bool>;
}

/// Record with bounded exponential backoff.
///
/// Returns the number of attempts used, or `OrchestrationIncomplete` once
/// the policy is exhausted.
pub async fn record_with_retry(
    sink: &dyn CompletionSink,
    record: &CompletionRecord,
    policy: &RetryPolicy,
) -> Result<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match sink.record(record).await {
            Ok(inserted) => {
                if !inserted {
                    tracing::debug!(job_id = %record.job_id, "Completion already recorded");
                }
                return Ok(attempt);
            }
            Err(e) if attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    job_id = %record.job_id,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Recording completion failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(CoreError::OrchestrationIncomplete {
                    job_id: record.job_id,
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[derive(Default)]
struct MemorySinkState {
    records: Vec<CompletionRecord>,
    seen: HashSet<JobId>,
    failures_left: u32,
}

/// In-memory sink, used in tests and when no database is configured.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemorySinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` record calls.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_left = n;
    }

    /// Stored records in insertion order.
    pub fn records(&self) -> Vec<CompletionRecord> {
        self.state.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CompletionSink for MemorySink {
    async fn record(&self, record: &CompletionRecord) -> Result<bool> {
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(CoreError::Sink("sink unavailable".into()));
        }
        if !state.seen.insert(record.job_id) {
            return Ok(false);
        }
        state.records.push(record.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobOutcome, JobSpec};
    use std::time::Duration;

    fn record() -> CompletionRecord {
        let job = Job::new(JobSpec::RecordEvent {
            message: "hello".into(),
        });
        CompletionRecord::new(&job, &Ok(JobOutcome::EventRecorded))
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_duplicate_records_ignored() {
        let sink = MemorySink::new();
        let rec = record();
        assert!(sink.record(&rec).await.unwrap());
        assert!(!sink.record(&rec).await.unwrap());
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let sink = MemorySink::new();
        sink.fail_next(2);
        let attempts = record_with_retry(&sink, &record(), &fast_policy(5))
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_is_incomplete() {
        let sink = MemorySink::new();
        sink.fail_next(10);
        let rec = record();
        let err = record_with_retry(&sink, &rec, &fast_policy(3))
            .await
            .unwrap_err();
        match err {
            CoreError::OrchestrationIncomplete {
                job_id, attempts, ..
            } => {
                assert_eq!(job_id, rec.job_id);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(sink.is_empty());
    }
}

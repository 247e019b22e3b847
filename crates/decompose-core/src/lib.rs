//! # decompose-core
//!
//! Job queue, worker pool and container lifecycle orchestration for
//! decompose.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     decompose-core                       │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  producer ──▶ JobTracker::submit ──▶ JobQueue            │
//! │                                        │ dequeue/ack     │
//! │                                        ▼                 │
//! │                                   WorkerPool             │
//! │                                        │                 │
//! │                  ┌─────────────────────┴───────┐         │
//! │                  ▼                             ▼         │
//! │            Orchestrator                 CompletionSink   │
//! │   - build_and_run()   - query()                          │
//! │   - kill_and_clean()  - start_all()/stop_all()           │
//! │   - list_managed()    - reclaim_images()                 │
//! │                  │                                       │
//! └──────────────────┼───────────────────────────────────────┘
//!                    ▼
//!        ContainerRuntime (decompose-runtime)
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use decompose_core::{
//!     JobSpec, JobTracker, MemoryQueue, MemorySink, Orchestrator, OrchestratorConfig,
//!     StaticRegistry, WorkerConfig, WorkerPool,
//! };
//! use decompose_runtime::{BuildContextRef, MemoryRuntime};
//!
//! # async fn example() -> decompose_core::Result<()> {
//! let orchestrator = Arc::new(Orchestrator::new(
//!     Arc::new(MemoryRuntime::new()),
//!     Arc::new(StaticRegistry::default()),
//!     OrchestratorConfig::default(),
//! ));
//! let queue = Arc::new(MemoryQueue::default());
//! let tracker = Arc::new(JobTracker::new());
//!
//! let mut pool = WorkerPool::new(
//!     queue.clone(),
//!     orchestrator,
//!     tracker.clone(),
//!     Arc::new(MemorySink::new()),
//!     WorkerConfig::default(),
//! );
//! pool.start();
//!
//! let id = tracker
//!     .submit(
//!         queue.as_ref(),
//!         JobSpec::BuildAndRun {
//!             name: "scan-a".into(),
//!             context: BuildContextRef::new("/targets/scan-a"),
//!         },
//!     )
//!     .await?;
//! let record = tracker.wait_for(&id, std::time::Duration::from_secs(60)).await;
//! println!("{record:?}");
//!
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod job;
mod orchestrator;
mod queue;
mod record;
mod registry;
mod sink;
mod tracker;
mod worker;

pub use config::{
    OrchestratorConfig, OrchestratorConfigBuilder, RetryPolicy, LABEL_CREATED_BY,
    LABEL_LOGICAL_NAME,
};
pub use error::{CoreError, FailureKind, Result};
pub use job::{CompletionRecord, Job, JobError, JobId, JobKind, JobOutcome, JobSpec, JobStatus};
pub use orchestrator::{
    BatchReport, ImageReclaim, ItemOutcome, LaunchOutcome, Orchestrator, RetainedImage,
    TeardownReport,
};
pub use queue::{JobQueue, MemoryQueue, QueueConfig};
pub use record::{
    validate_name, ContainerRecord, ContainerState, ImageRecord, ManagedInventory, Ownership,
};
pub use registry::{BuildTarget, DirectoryRegistry, StaticRegistry, TargetRegistry};
pub use sink::{record_with_retry, CompletionSink, MemorySink};
pub use tracker::{JobRecord, JobTracker};
pub use worker::{WorkerConfig, WorkerPool, WorkerStats, WorkerStatsSnapshot};

//! Container lifecycle orchestrator.
//!
//! Turns build-and-run and kill-and-clean requests into runtime calls while
//! keeping three properties:
//!
//! - at most one running managed container per logical name
//! - no managed container outlives its image, and a failed run removes the
//!   image it just built
//! - teardown of a name with nothing running is a successful no-op
//!
//! Discovery always goes through the ownership labels and every entity the
//! runtime returns is checked against them again before it is acted on.
//!
//! # Concurrency
//!
//! Builds for the same name may overlap. The final discovery re-check,
//! stale container removal and the run itself happen under a per-name
//! advisory lock, and a runtime name collision is treated as "already
//! running", so another orchestrator process racing for the same name
//! cannot produce a duplicate either. A managed container still in
//! `Created` and younger than `call_timeout` is another start in progress:
//! it is waited on, never removed.

use crate::config::OrchestratorConfig;
use crate::error::{CoreError, Result};
use crate::job::{JobError, JobOutcome};
use crate::record::{
    validate_name, ContainerRecord, ContainerState, ImageRecord, ManagedInventory, Ownership,
};
use crate::registry::{BuildTarget, TargetRegistry};
use chrono::Utc;
use decompose_runtime::{
    BuildContextRef, ContainerRuntime, ContainerStatus, ContainerSummary, Labels, RuntimeError,
};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Results
// ============================================================================

/// Result of a build-and-run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// A new container was started.
    Started { container_id: String },
    /// A managed container with the name was already running.
    AlreadyRunning { container_id: String },
}

impl LaunchOutcome {
    pub fn container_id(&self) -> &str {
        match self {
            Self::Started { container_id } | Self::AlreadyRunning { container_id } => {
                container_id
            }
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started { .. })
    }
}

/// An image that teardown could not remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetainedImage {
    pub image_id: String,
    pub reason: String,
}

/// Result of a kill-and-clean.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    pub name: String,
    /// Whether any container was removed by this call.
    pub removed: bool,
    pub containers: Vec<String>,
    pub images_removed: Vec<String>,
    /// Images left behind; reclaim them later with `reclaim_images`.
    pub image_retained: Vec<RetainedImage>,
}

impl TeardownReport {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            removed: false,
            containers: Vec::new(),
            images_removed: Vec::new(),
            image_retained: Vec::new(),
        }
    }
}

/// Outcome of one item in a bulk operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub name: String,
    pub outcome: Option<JobOutcome>,
    pub error: Option<JobError>,
}

impl ItemOutcome {
    fn new(name: String, result: Result<JobOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                name,
                outcome: Some(outcome),
                error: None,
            },
            Err(e) => Self {
                name,
                outcome: None,
                error: Some(JobError::from(&e)),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-item outcomes of a bulk operation, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.succeeded()
    }
}

/// Result of reclaiming one orphaned image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReclaim {
    pub image_id: String,
    pub logical_name: String,
    pub removed: bool,
    pub error: Option<String>,
}

/// Poll interval while waiting for another start of the same name.
const START_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// In-flight tracking
// ============================================================================

#[derive(Debug, Default)]
struct InFlight {
    building: usize,
    stopping: usize,
}

type ActivityMap = Mutex<HashMap<String, InFlight>>;

/// Marks a name as building or stopping for as long as it lives.
struct ActivityGuard<'a> {
    activity: &'a ActivityMap,
    name: String,
    state: ContainerState,
}

impl<'a> ActivityGuard<'a> {
    fn new(activity: &'a ActivityMap, name: &str, state: ContainerState) -> Self {
        let mut map = activity.lock();
        let entry = map.entry(name.to_string()).or_default();
        match state {
            ContainerState::Building => entry.building += 1,
            _ => entry.stopping += 1,
        }
        Self {
            activity,
            name: name.to_string(),
            state,
        }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        let mut map = self.activity.lock();
        if let Some(entry) = map.get_mut(&self.name) {
            match self.state {
                ContainerState::Building => entry.building = entry.building.saturating_sub(1),
                _ => entry.stopping = entry.stopping.saturating_sub(1),
            }
            if entry.building == 0 && entry.stopping == 0 {
                map.remove(&self.name);
            }
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Builds, runs, discovers and tears down managed containers.
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn TargetRegistry>,
    config: OrchestratorConfig,
    ownership: Ownership,
    name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    activity: ActivityMap,
}

impl Orchestrator {
    /// Create an orchestrator over an injected runtime and target registry.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn TargetRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        tracing::info!(
            owner = %config.owner,
            network_mode = %config.network_mode,
            build_timeout_secs = config.build_timeout.as_secs(),
            "Creating orchestrator"
        );
        Self {
            runtime,
            registry,
            ownership: Ownership::new(config.owner.clone()),
            config,
            name_locks: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn ownership(&self) -> &Ownership {
        &self.ownership
    }

    pub fn registry(&self) -> &Arc<dyn TargetRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn call<T>(
        &self,
        limit: Duration,
        fut: impl Future<Output = decompose_runtime::Result<T>>,
    ) -> decompose_runtime::Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout(limit)),
        }
    }

    /// Managed containers (any state) carrying `name`.
    async fn discover(&self, name: &str) -> decompose_runtime::Result<Vec<ContainerSummary>> {
        let filter = self.ownership.filter_for(name);
        let found = self
            .call(self.config.call_timeout, self.runtime.list_containers(&filter))
            .await?;
        Ok(found
            .into_iter()
            .filter(|c| self.ownership.logical_name(&c.labels) == Some(name))
            .collect())
    }

    /// A create-then-start by someone else that has not finished yet.
    fn is_starting(&self, container: &ContainerSummary) -> bool {
        if container.status != ContainerStatus::Created {
            return false;
        }
        match container.created_at {
            Some(created) => (Utc::now() - created)
                .to_std()
                .map_or(true, |age| age < self.config.call_timeout),
            None => false,
        }
    }

    /// Discover `name`, waiting up to `call_timeout` for starts in progress
    /// to either run or disappear.
    async fn discover_settled(
        &self,
        name: &str,
    ) -> decompose_runtime::Result<Vec<ContainerSummary>> {
        let deadline = Instant::now() + self.config.call_timeout;
        loop {
            let found = self.discover(name).await?;
            let running = found.iter().any(|c| c.status.is_running());
            let starting = found.iter().any(|c| self.is_starting(c));
            if running || !starting || Instant::now() >= deadline {
                return Ok(found);
            }
            tracing::debug!(name, "Waiting for a concurrent start to finish");
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
    }

    fn track(&self, name: &str, state: ContainerState) -> ActivityGuard<'_> {
        ActivityGuard::new(&self.activity, name, state)
    }

    /// Run `fut` while holding the advisory lock for `name`.
    async fn with_name_lock<T>(&self, name: &str, fut: impl Future<Output = T>) -> T {
        let lock = {
            let mut locks = self.name_locks.lock();
            Arc::clone(locks.entry(name.to_string()).or_default())
        };

        let out = {
            let _guard = lock.lock().await;
            fut.await
        };
        drop(lock);

        let mut locks = self.name_locks.lock();
        if locks.get(name).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(name);
        }
        out
    }

    /// Remove an image, reporting instead of failing.
    async fn try_remove_image(&self, image_id: &str) -> std::result::Result<bool, String> {
        match self
            .call(
                self.config.call_timeout,
                self.runtime
                    .remove_image(image_id, self.config.force_image_removal),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Drop a freshly built image that will not back a container.
    async fn discard_image(&self, name: &str, image_id: &str, keep: Option<&str>) {
        if keep == Some(image_id) {
            return;
        }
        if let Err(reason) = self.try_remove_image(image_id).await {
            tracing::warn!(name, image_id, error = %reason, "Failed to remove unused image");
        }
    }

    /// Force-remove a managed container that exists but is not running.
    /// `keep` is the image about to be run, which a cached rebuild may share
    /// with the stale container.
    async fn reclaim_stale(
        &self,
        name: &str,
        stale: &ContainerSummary,
        keep: &str,
    ) -> Result<()> {
        tracing::info!(
            name,
            container_id = %stale.id,
            status = %stale.status,
            "Removing stale container"
        );
        match self
            .call(
                self.config.call_timeout,
                self.runtime.remove_container(&stale.id, true),
            )
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                return Err(CoreError::RunFailed {
                    name: name.to_string(),
                    reason: format!("stale container {} could not be removed: {e}", stale.id),
                })
            }
        }
        if !stale.image_id.is_empty() {
            self.discard_image(name, &stale.image_id, Some(keep)).await;
        }
        Ok(())
    }

    /// Apply in-process activity to a record.
    fn overlay(&self, record: &mut ContainerRecord) {
        let activity = self.activity.lock();
        if let Some(entry) = activity.get(&record.name) {
            if entry.stopping > 0 {
                record.state = ContainerState::Stopping;
            }
        }
    }

    fn is_building(&self, name: &str) -> bool {
        self.activity
            .lock()
            .get(name)
            .is_some_and(|entry| entry.building > 0)
    }

    // ------------------------------------------------------------------------
    // Build and run
    // ------------------------------------------------------------------------

    /// Ensure a managed container named `name` is running, building its
    /// image from `context` if needed.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if `name` is not a valid container name
    /// - `BuildFailed` if the build fails or times out (nothing is created)
    /// - `RunFailed` if the container cannot be started; the built image
    ///   is removed
    pub async fn build_and_run(
        &self,
        name: &str,
        context: &BuildContextRef,
    ) -> Result<LaunchOutcome> {
        validate_name(name)?;
        let start = Instant::now();
        tracing::info!(name, context = %context, "Build and run requested");

        let existing = self.discover(name).await?;
        if let Some(running) = existing.iter().find(|c| c.status.is_running()) {
            tracing::info!(name, container_id = %running.id, "Container already running");
            return Ok(LaunchOutcome::AlreadyRunning {
                container_id: running.id.clone(),
            });
        }

        let _building = self.track(name, ContainerState::Building);
        let labels = self.ownership.labels_for(name);

        let image_id = self
            .call(
                self.config.build_timeout,
                self.runtime.build_image(context, name, &labels),
            )
            .await
            .map_err(|e| {
                tracing::warn!(name, error = %e, "Image build failed");
                CoreError::BuildFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
        tracing::debug!(name, image_id = %image_id, "Image built");

        let outcome = self
            .with_name_lock(name, self.launch(name, &image_id, &labels))
            .await?;

        tracing::info!(
            name,
            container_id = %outcome.container_id(),
            started = outcome.is_started(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Build and run complete"
        );
        Ok(outcome)
    }

    /// Re-check, clear stale containers and run. Caller holds the name lock.
    async fn launch(&self, name: &str, image_id: &str, labels: &Labels) -> Result<LaunchOutcome> {
        let current = match self.discover_settled(name).await {
            Ok(current) => current,
            Err(e) => {
                self.discard_image(name, image_id, None).await;
                return Err(CoreError::RunFailed {
                    name: name.to_string(),
                    reason: format!("discovery before run failed: {e}"),
                });
            }
        };

        if let Some(running) = current.iter().find(|c| c.status.is_running()) {
            tracing::info!(
                name,
                container_id = %running.id,
                "Container started concurrently, discarding new image"
            );
            self.discard_image(name, image_id, Some(&running.image_id))
                .await;
            return Ok(LaunchOutcome::AlreadyRunning {
                container_id: running.id.clone(),
            });
        }
        for stale in &current {
            if let Err(e) = self.reclaim_stale(name, stale, image_id).await {
                self.discard_image(name, image_id, None).await;
                return Err(e);
            }
        }

        let run = self
            .call(
                self.config.call_timeout,
                self.runtime
                    .run_container(image_id, name, labels, &self.config.network_mode),
            )
            .await;

        match run {
            Ok(container_id) => Ok(LaunchOutcome::Started { container_id }),
            Err(e) if e.is_name_conflict() => self.resolve_collision(name, image_id).await,
            Err(e) => {
                tracing::error!(name, error = %e, "Container run failed");
                self.discard_image(name, image_id, None).await;
                Err(CoreError::RunFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// The runtime refused the name. Succeed if a managed container with
    /// that name is running once any start in progress has settled.
    async fn resolve_collision(&self, name: &str, image_id: &str) -> Result<LaunchOutcome> {
        let winner = self
            .discover_settled(name)
            .await
            .ok()
            .and_then(|found| found.into_iter().find(|c| c.status.is_running()));

        match winner {
            Some(container) => {
                tracing::info!(
                    name,
                    container_id = %container.id,
                    "Name collision with running container, treating as already running"
                );
                self.discard_image(name, image_id, Some(&container.image_id))
                    .await;
                Ok(LaunchOutcome::AlreadyRunning {
                    container_id: container.id,
                })
            }
            None => {
                tracing::error!(name, "Name held by a container this orchestrator does not run");
                self.discard_image(name, image_id, None).await;
                Err(CoreError::RunFailed {
                    name: name.to_string(),
                    reason: "name is held by another container".to_string(),
                })
            }
        }
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    /// Remove every managed container named `name` and the images behind them.
    ///
    /// Image removal is best effort; failures land in
    /// [`TeardownReport::image_retained`]. A name no managed container can
    /// carry has nothing to tear down and is a no-op.
    pub async fn kill_and_clean(&self, name: &str) -> Result<TeardownReport> {
        if let Err(e) = validate_name(name) {
            tracing::debug!(name, error = %e, "Name cannot be managed, nothing to tear down");
            return Ok(TeardownReport::empty(name));
        }
        tracing::info!(name, "Kill and clean requested");

        let _stopping = self.track(name, ContainerState::Stopping);
        let report = self.with_name_lock(name, self.teardown(name)).await?;

        tracing::info!(
            name,
            removed = report.removed,
            containers = report.containers.len(),
            images_removed = report.images_removed.len(),
            images_retained = report.image_retained.len(),
            "Kill and clean complete"
        );
        Ok(report)
    }

    async fn teardown(&self, name: &str) -> Result<TeardownReport> {
        let teardown_failed = |reason: String| CoreError::TeardownFailed {
            name: name.to_string(),
            reason,
        };

        let found = self
            .discover(name)
            .await
            .map_err(|e| teardown_failed(e.to_string()))?;

        let mut report = TeardownReport::empty(name);
        if found.is_empty() {
            tracing::debug!(name, "Nothing to tear down");
            return Ok(report);
        }

        let mut images: Vec<String> = Vec::new();
        for container in &found {
            match self
                .call(
                    self.config.call_timeout,
                    self.runtime.remove_container(&container.id, true),
                )
                .await
            {
                Ok(()) => report.containers.push(container.id.clone()),
                Err(e) if e.is_not_found() => {
                    tracing::debug!(name, container_id = %container.id, "Container already gone");
                }
                Err(e) => {
                    tracing::error!(name, container_id = %container.id, error = %e, "Container removal failed");
                    return Err(teardown_failed(e.to_string()));
                }
            }
            if !container.image_id.is_empty() && !images.contains(&container.image_id) {
                images.push(container.image_id.clone());
            }
        }
        report.removed = !report.containers.is_empty();

        for image_id in images {
            match self.try_remove_image(&image_id).await {
                Ok(true) => report.images_removed.push(image_id),
                Ok(false) => {}
                Err(reason) => {
                    tracing::warn!(name, image_id = %image_id, error = %reason, "Image retained after teardown");
                    report
                        .image_retained
                        .push(RetainedImage { image_id, reason });
                }
            }
        }

        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Every managed container and image. Unlabeled entities never appear.
    pub async fn list_managed(&self) -> Result<ManagedInventory> {
        let filter = self.ownership.filter();
        let containers = self
            .call(self.config.call_timeout, self.runtime.list_containers(&filter))
            .await?;
        let images = self
            .call(self.config.call_timeout, self.runtime.list_images(&filter))
            .await?;

        let mut records: Vec<ContainerRecord> = containers
            .iter()
            .filter_map(|c| ContainerRecord::from_summary(&self.ownership, c))
            .collect();
        for record in records.iter_mut() {
            self.overlay(record);
        }

        let building: Vec<String> = self
            .activity
            .lock()
            .iter()
            .filter(|(_, entry)| entry.building > 0)
            .map(|(name, _)| name.clone())
            .collect();
        for name in building {
            if !records.iter().any(|r| r.name == name) {
                records.push(ContainerRecord::building(&self.ownership, &name));
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));

        let mut images: Vec<ImageRecord> = images
            .iter()
            .filter_map(|i| ImageRecord::from_summary(&self.ownership, i))
            .collect();
        images.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));

        Ok(ManagedInventory {
            containers: records,
            images,
        })
    }

    /// Current record for one logical name, if anything is present.
    pub async fn query(&self, name: &str) -> Result<Option<ContainerRecord>> {
        validate_name(name)?;
        let found = self.discover(name).await?;
        let chosen = found
            .iter()
            .find(|c| c.status.is_running())
            .or_else(|| found.first());

        match chosen.and_then(|c| ContainerRecord::from_summary(&self.ownership, c)) {
            Some(mut record) => {
                self.overlay(&mut record);
                Ok(Some(record))
            }
            None if self.is_building(name) => {
                Ok(Some(ContainerRecord::building(&self.ownership, name)))
            }
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------------

    /// Build and run every target (the registry's when `targets` is `None`).
    pub async fn start_all(&self, targets: Option<Vec<BuildTarget>>) -> Result<BatchReport> {
        let targets = match targets {
            Some(targets) => targets,
            None => self.registry.targets().await?,
        };
        tracing::info!(count = targets.len(), "Starting all targets");

        let mut items: Vec<ItemOutcome> = stream::iter(targets)
            .map(|target| async move {
                let result = self
                    .build_and_run(&target.name, &target.context)
                    .await
                    .map(JobOutcome::Launched);
                ItemOutcome::new(target.name, result)
            })
            .buffer_unordered(self.config.bulk_concurrency)
            .collect()
            .await;
        items.sort_by(|a, b| a.name.cmp(&b.name));

        let report = BatchReport { items };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Start all complete"
        );
        Ok(report)
    }

    /// Names covered by stop-all: registry names plus discovered managed names.
    pub async fn stop_all_names(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        match self.registry.targets().await {
            Ok(targets) => names.extend(targets.into_iter().map(|t| t.name)),
            Err(e) => tracing::warn!(error = %e, "Registry unavailable, stopping discovered containers only"),
        }

        let managed = self
            .call(
                self.config.call_timeout,
                self.runtime.list_containers(&self.ownership.filter()),
            )
            .await?;
        names.extend(
            managed
                .iter()
                .filter_map(|c| self.ownership.logical_name(&c.labels))
                .map(str::to_string),
        );
        Ok(names.into_iter().collect())
    }

    /// Kill and clean every known or discovered name.
    pub async fn stop_all(&self) -> Result<BatchReport> {
        let names = self.stop_all_names().await?;
        tracing::info!(count = names.len(), "Stopping all containers");

        let mut items: Vec<ItemOutcome> = stream::iter(names)
            .map(|name| async move {
                let result = self.kill_and_clean(&name).await.map(JobOutcome::TornDown);
                ItemOutcome::new(name, result)
            })
            .buffer_unordered(self.config.bulk_concurrency)
            .collect()
            .await;
        items.sort_by(|a, b| a.name.cmp(&b.name));

        let report = BatchReport { items };
        tracing::info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Stop all complete"
        );
        Ok(report)
    }

    /// Remove managed images that no managed container uses.
    ///
    /// Skipped: names with a build or teardown in flight in this process, and
    /// images younger than `image_reclaim_grace`, which may be a build
    /// another orchestrator process is about to run.
    pub async fn reclaim_images(&self) -> Result<Vec<ImageReclaim>> {
        let filter = self.ownership.filter();
        let containers = self
            .call(self.config.call_timeout, self.runtime.list_containers(&filter))
            .await?;
        let images = self
            .call(self.config.call_timeout, self.runtime.list_images(&filter))
            .await?;

        let used: HashSet<&str> = containers.iter().map(|c| c.image_id.as_str()).collect();
        let busy: HashSet<String> = self.activity.lock().keys().cloned().collect();

        let mut results = Vec::new();
        for image in &images {
            let Some(name) = self.ownership.logical_name(&image.labels) else {
                continue;
            };
            if used.contains(image.id.as_str()) || busy.contains(name) {
                continue;
            }
            let fresh = image.created_at.is_some_and(|created| {
                (Utc::now() - created)
                    .to_std()
                    .map_or(true, |age| age < self.config.image_reclaim_grace)
            });
            if fresh {
                tracing::debug!(name, image_id = %image.id, "Image too recent to reclaim");
                continue;
            }

            let (removed, error) = match self.try_remove_image(&image.id).await {
                Ok(removed) => (removed, None),
                Err(reason) => {
                    tracing::warn!(name, image_id = %image.id, error = %reason, "Image reclaim failed");
                    (false, Some(reason))
                }
            };
            results.push(ImageReclaim {
                image_id: image.id.clone(),
                logical_name: name.to_string(),
                removed,
                error,
            });
        }

        tracing::info!(
            reclaimed = results.iter().filter(|r| r.removed).count(),
            failed = results.iter().filter(|r| r.error.is_some()).count(),
            "Image reclaim complete"
        );
        Ok(results)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::registry::StaticRegistry;
    use decompose_runtime::{ContainerStatus, ImageSummary, MemoryRuntime};

    fn ctx(name: &str) -> BuildContextRef {
        BuildContextRef::new(format!("/targets/{name}"))
    }

    fn setup_with(
        config: OrchestratorConfig,
        targets: Vec<BuildTarget>,
    ) -> (Arc<MemoryRuntime>, Arc<Orchestrator>) {
        let runtime = Arc::new(MemoryRuntime::new());
        let registry = Arc::new(StaticRegistry::new(targets));
        let orch = Arc::new(Orchestrator::new(runtime.clone(), registry, config));
        (runtime, orch)
    }

    fn setup() -> (Arc<MemoryRuntime>, Arc<Orchestrator>) {
        setup_with(OrchestratorConfig::default(), Vec::new())
    }

    fn foreign_container(name: &str) -> ContainerSummary {
        ContainerSummary {
            id: format!("foreign-{name}"),
            name: name.to_string(),
            image_id: "sha256:foreign".into(),
            labels: Labels::new(),
            status: ContainerStatus::Running,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_build_and_run_starts_container() {
        let (runtime, orch) = setup();

        let outcome = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        assert!(outcome.is_started());
        assert_eq!(runtime.running_named("scan-a"), 1);

        let inventory = orch.list_managed().await.unwrap();
        assert_eq!(inventory.containers.len(), 1);
        let record = &inventory.containers[0];
        assert_eq!(record.name, "scan-a");
        assert_eq!(record.state, ContainerState::Running);
        assert_eq!(record.container_id.as_deref(), Some(outcome.container_id()));
        assert_eq!(inventory.images.len(), 1);
        assert_eq!(inventory.images[0].logical_name, "scan-a");
    }

    #[tokio::test]
    async fn test_second_build_and_run_is_noop() {
        let (runtime, orch) = setup();

        let first = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        let second = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();

        assert_eq!(
            second,
            LaunchOutcome::AlreadyRunning {
                container_id: first.container_id().to_string()
            }
        );
        assert_eq!(runtime.build_count(), 1);
        assert_eq!(runtime.running_named("scan-a"), 1);
    }

    #[tokio::test]
    async fn test_kill_and_clean_removes_container_and_image() {
        let (runtime, orch) = setup();
        let launched = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();

        let report = orch.kill_and_clean("scan-a").await.unwrap();
        assert!(report.removed);
        assert_eq!(report.containers, vec![launched.container_id().to_string()]);
        assert_eq!(report.images_removed.len(), 1);
        assert!(report.image_retained.is_empty());
        assert!(runtime.containers().is_empty());
        assert!(runtime.images().is_empty());
        assert!(orch.query("scan-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_teardown_is_idempotent() {
        let (_runtime, orch) = setup();
        orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();

        assert!(orch.kill_and_clean("scan-a").await.unwrap().removed);
        let again = orch.kill_and_clean("scan-a").await.unwrap();
        assert!(!again.removed);
        assert!(again.containers.is_empty());

        let never = orch.kill_and_clean("never-started").await.unwrap();
        assert!(!never.removed);
    }

    #[tokio::test]
    async fn test_build_failure_creates_nothing() {
        let (runtime, orch) = setup();
        runtime.fail_build(&ctx("broken"));

        let err = orch.build_and_run("broken", &ctx("broken")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::BuildFailed);
        assert!(runtime.containers().is_empty());
        assert!(runtime.images().is_empty());
        assert!(orch.query("broken").await.unwrap().is_none());
        let inventory = orch.list_managed().await.unwrap();
        assert!(inventory.containers.iter().all(|c| c.name != "broken"));
        assert!(inventory.images.is_empty());
    }

    #[tokio::test]
    async fn test_build_timeout_is_build_failure() {
        let config = OrchestratorConfig::builder()
            .build_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let (runtime, orch) = setup_with(config, Vec::new());
        runtime.set_build_delay(Duration::from_millis(500));

        let err = orch.build_and_run("slow", &ctx("slow")).await.unwrap_err();
        assert!(matches!(err, CoreError::BuildFailed { .. }));
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_unlabeled_containers_are_invisible() {
        let (runtime, orch) = setup();
        runtime.insert_container(foreign_container("postgres"));
        orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();

        let inventory = orch.list_managed().await.unwrap();
        let names: Vec<&str> = inventory.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["scan-a"]);

        let report = orch.stop_all().await.unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(runtime.running_named("postgres"), 1);
    }

    #[tokio::test]
    async fn test_other_owner_is_invisible() {
        let (runtime, orch) = setup();
        let mut theirs = foreign_container("scan-a");
        theirs.labels = Ownership::new("someone-else").labels_for("scan-a");
        runtime.insert_container(theirs);

        assert!(orch.list_managed().await.unwrap().containers.is_empty());
        assert!(orch.query("scan-a").await.unwrap().is_none());
        assert!(!orch.kill_and_clean("scan-a").await.unwrap().removed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_build_and_run_yields_one_container() {
        let (runtime, orch) = setup();
        runtime.set_build_delay(Duration::from_millis(50));

        let a = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.build_and_run("scan-a", &ctx("scan-a")).await })
        };
        let b = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.build_and_run("scan-a", &ctx("scan-a")).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.container_id(), b.container_id());
        assert_eq!(
            [a.is_started(), b.is_started()].iter().filter(|s| **s).count(),
            1
        );
        assert_eq!(runtime.running_named("scan-a"), 1);
        // The losing build's image is discarded.
        assert_eq!(runtime.images().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_build_and_run_during_slow_start() {
        let (runtime, orch) = setup();
        runtime.set_start_delay(Duration::from_millis(200));

        let a = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.build_and_run("scan-a", &ctx("scan-a")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.build_and_run("scan-a", &ctx("scan-a")).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(a.is_started());
        assert_eq!(
            b,
            LaunchOutcome::AlreadyRunning {
                container_id: a.container_id().to_string()
            }
        );
        assert_eq!(runtime.running_named("scan-a"), 1);
        assert_eq!(runtime.containers().len(), 1);
        assert_eq!(runtime.images().len(), 1);
    }

    #[tokio::test]
    async fn test_starting_peer_container_is_already_running() {
        let (runtime, orch) = setup();
        let labels = orch.ownership().labels_for("scan-a");
        runtime.insert_image(ImageSummary {
            id: "sha256:peer".into(),
            tags: vec!["scan-a:latest".into()],
            labels: labels.clone(),
            created_at: Some(Utc::now()),
        });
        runtime.insert_container(ContainerSummary {
            id: "peer".into(),
            name: "scan-a".into(),
            image_id: "sha256:peer".into(),
            labels,
            status: ContainerStatus::Created,
            created_at: Some(Utc::now()),
        });

        let finisher = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                runtime.set_container_status("peer", ContainerStatus::Running);
            })
        };

        let outcome = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        finisher.await.unwrap();
        assert_eq!(
            outcome,
            LaunchOutcome::AlreadyRunning {
                container_id: "peer".into()
            }
        );
        assert_eq!(runtime.run_count(), 0);
        let images: Vec<String> = runtime.images().into_iter().map(|i| i.id).collect();
        assert_eq!(images, vec!["sha256:peer".to_string()]);
    }

    #[tokio::test]
    async fn test_abandoned_created_container_is_replaced() {
        let (runtime, orch) = setup();
        runtime.insert_container(ContainerSummary {
            id: "abandoned".into(),
            name: "scan-a".into(),
            image_id: String::new(),
            labels: orch.ownership().labels_for("scan-a"),
            status: ContainerStatus::Created,
            created_at: Some(Utc::now() - chrono::Duration::hours(1)),
        });

        let outcome = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        assert!(outcome.is_started());
        let containers = runtime.containers();
        assert_eq!(containers.len(), 1);
        assert_ne!(containers[0].id, "abandoned");
        assert!(containers[0].status.is_running());
    }

    #[tokio::test]
    async fn test_run_collision_is_already_running() {
        let (runtime, orch) = setup();
        runtime.race_on_run("scan-a");

        let outcome = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        assert!(!outcome.is_started());
        assert_eq!(runtime.running_named("scan-a"), 1);
        assert_eq!(runtime.run_count(), 0);
    }

    #[tokio::test]
    async fn test_collision_with_foreign_container_fails() {
        let (runtime, orch) = setup();
        runtime.insert_container(foreign_container("scan-a"));

        let err = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::RunFailed);
        assert!(runtime.images().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_removes_built_image() {
        let (runtime, orch) = setup();
        runtime.fail_run("scan-a");

        let err = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap_err();
        assert!(matches!(err, CoreError::RunFailed { .. }));
        assert_eq!(runtime.build_count(), 1);
        assert!(runtime.images().is_empty());
        assert!(runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_stale_container_is_replaced() {
        let (runtime, orch) = setup();
        let labels = orch.ownership().labels_for("scan-a");
        runtime.insert_image(ImageSummary {
            id: "sha256:old".into(),
            tags: vec!["scan-a:latest".into()],
            labels: labels.clone(),
            created_at: None,
        });
        runtime.insert_container(ContainerSummary {
            id: "stale".into(),
            name: "scan-a".into(),
            image_id: "sha256:old".into(),
            labels,
            status: ContainerStatus::Exited,
            created_at: None,
        });

        let outcome = orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        assert!(outcome.is_started());
        assert_ne!(outcome.container_id(), "stale");

        let containers = runtime.containers();
        assert_eq!(containers.len(), 1);
        assert!(containers[0].status.is_running());
        assert!(runtime.images().iter().all(|i| i.id != "sha256:old"));
    }

    #[tokio::test]
    async fn test_teardown_failure_is_reported() {
        let (runtime, orch) = setup();
        orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        runtime.fail_container_removal("scan-a");

        let err = orch.kill_and_clean("scan-a").await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::TeardownFailed);
        assert_eq!(runtime.running_named("scan-a"), 1);
    }

    #[tokio::test]
    async fn test_image_retained_is_reported_then_reclaimed() {
        let config = OrchestratorConfig::builder()
            .image_reclaim_grace(Duration::ZERO)
            .build()
            .unwrap();
        let (runtime, orch) = setup_with(config, Vec::new());
        orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        let image_id = runtime.images()[0].id.clone();
        runtime.fail_image_removal(&image_id);

        let report = orch.kill_and_clean("scan-a").await.unwrap();
        assert!(report.removed);
        assert_eq!(report.image_retained.len(), 1);
        assert_eq!(report.image_retained[0].image_id, image_id);
        assert!(runtime.containers().is_empty());
        assert_eq!(runtime.images().len(), 1);

        // Still locked: reclaim reports the failure per image.
        let results = orch.reclaim_images().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].removed);
        assert!(results[0].error.is_some());
    }

    #[tokio::test]
    async fn test_reclaim_images_skips_used_images() {
        let (runtime, orch) = setup();
        orch.build_and_run("scan-a", &ctx("scan-a")).await.unwrap();
        runtime.insert_image(ImageSummary {
            id: "sha256:orphan".into(),
            tags: Vec::new(),
            labels: orch.ownership().labels_for("scan-b"),
            created_at: None,
        });
        runtime.insert_image(ImageSummary {
            id: "sha256:unmanaged".into(),
            tags: vec!["postgres:16".into()],
            labels: Labels::new(),
            created_at: None,
        });

        let results = orch.reclaim_images().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].image_id, "sha256:orphan");
        assert_eq!(results[0].logical_name, "scan-b");
        assert!(results[0].removed);
        assert_eq!(runtime.images().len(), 2);
    }

    #[tokio::test]
    async fn test_reclaim_skips_fresh_images() {
        fn orphan(orch: &Orchestrator) -> ImageSummary {
            ImageSummary {
                id: "sha256:fresh".into(),
                tags: Vec::new(),
                labels: orch.ownership().labels_for("scan-b"),
                created_at: Some(Utc::now()),
            }
        }

        let (runtime, orch) = setup();
        runtime.insert_image(orphan(&orch));
        assert!(orch.reclaim_images().await.unwrap().is_empty());
        assert_eq!(runtime.images().len(), 1);

        let config = OrchestratorConfig::builder()
            .image_reclaim_grace(Duration::ZERO)
            .build()
            .unwrap();
        let (runtime, orch) = setup_with(config, Vec::new());
        runtime.insert_image(orphan(&orch));
        let results = orch.reclaim_images().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].removed);
        assert!(runtime.images().is_empty());
    }

    #[tokio::test]
    async fn test_query_reports_building() {
        let (runtime, orch) = setup();
        runtime.set_build_delay(Duration::from_millis(300));

        let task = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.build_and_run("scan-a", &ctx("scan-a")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = orch.query("scan-a").await.unwrap().unwrap();
        assert_eq!(record.state, ContainerState::Building);
        assert!(record.container_id.is_none());
        let inventory = orch.list_managed().await.unwrap();
        assert_eq!(inventory.containers[0].state, ContainerState::Building);

        task.await.unwrap().unwrap();
        let record = orch.query("scan-a").await.unwrap().unwrap();
        assert_eq!(record.state, ContainerState::Running);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let (runtime, orch) = setup();
        let err = orch
            .build_and_run("Bad Name", &ctx("bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidName(_)));
        assert_eq!(runtime.build_count(), 0);

        // No managed container can carry these names, so teardown is a no-op.
        for name in ["../x", "Scan-A"] {
            let report = orch.kill_and_clean(name).await.unwrap();
            assert!(!report.removed);
            assert!(report.containers.is_empty());
        }
    }

    #[tokio::test]
    async fn test_start_all_reports_per_item() {
        let targets = vec![
            BuildTarget::new("api", ctx("api")),
            BuildTarget::new("broken", ctx("broken")),
            BuildTarget::new("web", ctx("web")),
        ];
        let (runtime, orch) = setup_with(OrchestratorConfig::default(), targets);
        runtime.fail_build(&ctx("broken"));

        let report = orch.start_all(None).await.unwrap();
        let names: Vec<&str> = report.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["api", "broken", "web"]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(
            report.items[1].error.as_ref().unwrap().kind,
            FailureKind::BuildFailed
        );
        assert_eq!(runtime.running_named("api"), 1);
        assert_eq!(runtime.running_named("web"), 1);
    }

    #[tokio::test]
    async fn test_stop_all_covers_registry_and_discovered() {
        let targets = vec![BuildTarget::new("api", ctx("api"))];
        let (runtime, orch) = setup_with(OrchestratorConfig::default(), targets);
        orch.build_and_run("api", &ctx("api")).await.unwrap();
        orch.build_and_run("adhoc", &ctx("adhoc")).await.unwrap();

        assert_eq!(orch.stop_all_names().await.unwrap(), vec!["adhoc", "api"]);

        let report = orch.stop_all().await.unwrap();
        assert_eq!(report.succeeded(), 2);
        assert!(runtime.containers().is_empty());
        assert!(runtime.images().is_empty());
    }

    #[tokio::test]
    async fn test_stop_all_includes_registered_names_without_containers() {
        let targets = vec![
            BuildTarget::new("api", ctx("api")),
            BuildTarget::new("idle", ctx("idle")),
        ];
        let (runtime, orch) = setup_with(OrchestratorConfig::default(), targets);
        orch.build_and_run("api", &ctx("api")).await.unwrap();

        let report = orch.stop_all().await.unwrap();
        let names: Vec<&str> = report.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["api", "idle"]);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 0);
        assert!(runtime.containers().is_empty());
    }
}

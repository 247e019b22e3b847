//! In-memory implementation of [`ContainerRuntime`].
//!
//! Mirrors the Docker semantics the orchestrator relies on (name
//! uniqueness, tag moves, in-use image protection, label filtering) and
//! exposes hooks to inject failures and races.

use crate::error::{Result, RuntimeError};
use crate::types::{
    BuildContextRef, ContainerRuntime, ContainerStatus, ContainerSummary, ImageSummary,
    LabelFilter, Labels,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct State {
    containers: Vec<ContainerSummary>,
    images: Vec<ImageSummary>,
    failing_contexts: HashSet<String>,
    failing_runs: HashSet<String>,
    raced_runs: HashSet<String>,
    failing_container_removals: HashSet<String>,
    failing_image_removals: HashSet<String>,
    build_delay: Option<Duration>,
    start_delay: Option<Duration>,
    builds: u64,
    runs: u64,
}

/// Container runtime that keeps all state in process memory.
#[derive(Default)]
pub struct MemoryRuntime {
    state: Mutex<State>,
}

fn short_id() -> String {
    format!("sha256:{}", Uuid::new_v4().simple())
}

impl MemoryRuntime {
    /// Create an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every build of `context` fail.
    pub fn fail_build(&self, context: &BuildContextRef) {
        self.state
            .lock()
            .failing_contexts
            .insert(context.as_str().to_string());
    }

    /// Delay every build, widening race windows in tests.
    pub fn set_build_delay(&self, delay: Duration) {
        self.state.lock().build_delay = Some(delay);
    }

    /// Split every run into create and start, with `delay` between them.
    /// The container is listed as `Created` during that window, as with
    /// Docker's create-then-start.
    pub fn set_start_delay(&self, delay: Duration) {
        self.state.lock().start_delay = Some(delay);
    }

    /// Change the status of a container, e.g. a peer finishing its start.
    pub fn set_container_status(&self, id: &str, status: ContainerStatus) {
        if let Some(container) = self
            .state
            .lock()
            .containers
            .iter_mut()
            .find(|c| c.id == id)
        {
            container.status = status;
        }
    }

    /// Make runs of containers named `name` fail with an unavailable error.
    pub fn fail_run(&self, name: &str) {
        self.state.lock().failing_runs.insert(name.to_string());
    }

    /// Simulate another orchestrator instance winning the race: the next
    /// run of `name` first starts a competing container with the same name
    /// and labels, so the requested run collides.
    pub fn race_on_run(&self, name: &str) {
        self.state.lock().raced_runs.insert(name.to_string());
    }

    /// Make removal of the container named `name` fail.
    pub fn fail_container_removal(&self, name: &str) {
        self.state
            .lock()
            .failing_container_removals
            .insert(name.to_string());
    }

    /// Make removal of image `image_id` fail with a conflict.
    pub fn fail_image_removal(&self, image_id: &str) {
        self.state
            .lock()
            .failing_image_removals
            .insert(image_id.to_string());
    }

    /// Insert an arbitrary container, e.g. one this system did not create.
    pub fn insert_container(&self, container: ContainerSummary) {
        self.state.lock().containers.push(container);
    }

    /// Insert an arbitrary image.
    pub fn insert_image(&self, image: ImageSummary) {
        self.state.lock().images.push(image);
    }

    /// Snapshot of every container, labeled or not.
    pub fn containers(&self) -> Vec<ContainerSummary> {
        self.state.lock().containers.clone()
    }

    /// Snapshot of every image, labeled or not.
    pub fn images(&self) -> Vec<ImageSummary> {
        self.state.lock().images.clone()
    }

    /// Number of running containers with the given name.
    pub fn running_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .containers
            .iter()
            .filter(|c| c.name == name && c.status.is_running())
            .count()
    }

    /// Total builds performed.
    pub fn build_count(&self) -> u64 {
        self.state.lock().builds
    }

    /// Total successful runs.
    pub fn run_count(&self) -> u64 {
        self.state.lock().runs
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn build_image(
        &self,
        context: &BuildContextRef,
        tag: &str,
        labels: &Labels,
    ) -> Result<String> {
        let delay = self.state.lock().build_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.failing_contexts.contains(context.as_str()) {
            return Err(RuntimeError::Build(format!(
                "failed to build {tag} from {context}"
            )));
        }

        let full_tag = format!("{tag}:latest");
        for image in state.images.iter_mut() {
            image.tags.retain(|t| t != &full_tag);
        }

        let id = short_id();
        state.images.push(ImageSummary {
            id: id.clone(),
            tags: vec![full_tag],
            labels: labels.clone(),
            created_at: Some(Utc::now()),
        });
        state.builds += 1;
        Ok(id)
    }

    async fn run_container(
        &self,
        image_id: &str,
        name: &str,
        labels: &Labels,
        _network_mode: &str,
    ) -> Result<String> {
        let (id, start_delay) = {
            let mut state = self.state.lock();

            if state.raced_runs.remove(name) {
                state.containers.push(ContainerSummary {
                    id: Uuid::new_v4().simple().to_string(),
                    name: name.to_string(),
                    image_id: image_id.to_string(),
                    labels: labels.clone(),
                    status: ContainerStatus::Running,
                    created_at: Some(Utc::now()),
                });
            }

            if state.failing_runs.contains(name) {
                return Err(RuntimeError::Unavailable(format!("cannot run {name}")));
            }
            if state.containers.iter().any(|c| c.name == name) {
                return Err(RuntimeError::NameConflict(name.to_string()));
            }
            if !state.images.iter().any(|i| i.id == image_id) {
                return Err(RuntimeError::NotFound(image_id.to_string()));
            }

            let id = Uuid::new_v4().simple().to_string();
            let start_delay = state.start_delay;
            state.containers.push(ContainerSummary {
                id: id.clone(),
                name: name.to_string(),
                image_id: image_id.to_string(),
                labels: labels.clone(),
                status: if start_delay.is_some() {
                    ContainerStatus::Created
                } else {
                    ContainerStatus::Running
                },
                created_at: Some(Utc::now()),
            });
            if start_delay.is_none() {
                state.runs += 1;
            }
            (id, start_delay)
        };

        if let Some(delay) = start_delay {
            tokio::time::sleep(delay).await;
            let mut state = self.state.lock();
            let container = state
                .containers
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
            container.status = ContainerStatus::Running;
            state.runs += 1;
        }
        Ok(id)
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .containers
            .iter()
            .position(|c| c.id == name_or_id || c.name == name_or_id)
            .ok_or_else(|| RuntimeError::NotFound(name_or_id.to_string()))?;

        let container = &state.containers[pos];
        if state.failing_container_removals.contains(&container.name) {
            return Err(RuntimeError::Unavailable(format!(
                "cannot remove {}",
                container.name
            )));
        }
        if container.status.is_running() && !force {
            return Err(RuntimeError::Conflict(format!(
                "container {} is running",
                container.name
            )));
        }

        state.containers.remove(pos);
        Ok(())
    }

    async fn remove_image(&self, image_id: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        let pos = state
            .images
            .iter()
            .position(|i| i.id == image_id || i.tags.iter().any(|t| t == image_id))
            .ok_or_else(|| RuntimeError::NotFound(image_id.to_string()))?;

        let id = state.images[pos].id.clone();
        if state.failing_image_removals.contains(&id) {
            return Err(RuntimeError::Conflict(format!("image {id} is locked")));
        }
        let users: Vec<&ContainerSummary> =
            state.containers.iter().filter(|c| c.image_id == id).collect();
        if users.iter().any(|c| c.status.is_running()) || (!users.is_empty() && !force) {
            return Err(RuntimeError::Conflict(format!(
                "image {id} is in use by a container"
            )));
        }

        state.images.remove(pos);
        Ok(())
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .cloned()
            .collect())
    }

    async fn list_images(&self, filter: &LabelFilter) -> Result<Vec<ImageSummary>> {
        Ok(self
            .state
            .lock()
            .images
            .iter()
            .filter(|i| filter.matches(&i.labels))
            .cloned()
            .collect())
    }
}

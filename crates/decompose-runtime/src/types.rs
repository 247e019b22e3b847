//! Runtime capability trait and the values it exchanges.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Label map attached to containers and images.
pub type Labels = HashMap<String, String>;

/// Opaque locator for the inputs of an image build.
///
/// The orchestrator never inspects it; the runtime implementation decides
/// how to resolve it (the Docker runtime treats it as a directory path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildContextRef(String);

impl BuildContextRef {
    /// Create a new build context reference.
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    /// Get the raw locator.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Interpret the locator as a filesystem path.
    pub fn as_path(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for BuildContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&Path> for BuildContextRef {
    fn from(path: &Path) -> Self {
        Self(path.to_string_lossy().into_owned())
    }
}

/// Runtime-reported state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse the state string reported by the Docker API.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "removing" => Self::Removing,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            _ => Self::Unknown,
        }
    }

    /// Whether the container is currently executing its workload.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    /// Container name without the leading `/` Docker adds.
    pub name: String,
    pub image_id: String,
    pub labels: Labels,
    pub status: ContainerStatus,
    pub created_at: Option<DateTime<Utc>>,
}

/// An image as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub tags: Vec<String>,
    pub labels: Labels,
    pub created_at: Option<DateTime<Utc>>,
}

/// Conjunction of `key=value` label requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pairs: Vec<(String, String)>,
}

impl LabelFilter {
    /// Create an empty filter (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Check whether a label map satisfies every requirement.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.pairs
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Render as a Docker API `filters` map.
    pub fn to_docker_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if !self.pairs.is_empty() {
            filters.insert(
                "label".to_string(),
                self.pairs.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }
        filters
    }
}

/// Capability interface over the host's container engine.
///
/// Every call is fallible and may block for a long time; callers are
/// expected to bound them with their own timeouts.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from `context`, tag it `tag` and apply `labels`.
    /// Returns the image id.
    async fn build_image(&self, context: &BuildContextRef, tag: &str, labels: &Labels)
        -> Result<String>;

    /// Create and start a detached container named `name` from `image_id`.
    /// Returns the container id. A name collision is reported as
    /// [`RuntimeError::NameConflict`](crate::RuntimeError::NameConflict).
    async fn run_container(
        &self,
        image_id: &str,
        name: &str,
        labels: &Labels,
        network_mode: &str,
    ) -> Result<String>;

    /// Remove a container by name or id.
    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()>;

    /// Remove an image by id or tag.
    async fn remove_image(&self, image_id: &str, force: bool) -> Result<()>;

    /// List containers (in any state) matching `filter`.
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>>;

    /// List images matching `filter`.
    async fn list_images(&self, filter: &LabelFilter) -> Result<Vec<ImageSummary>>;
}

//! Managed container and image records, derived from runtime listings.

use crate::config::{LABEL_CREATED_BY, LABEL_LOGICAL_NAME};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use decompose_runtime::{ContainerStatus, ContainerSummary, ImageSummary, LabelFilter, Labels};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest accepted logical name.
const MAX_NAME_LEN: usize = 128;

/// Check that `name` can serve as both a container name and an image tag.
///
/// Accepts lowercase ASCII letters, digits, `_`, `.` and `-`; the first and
/// last character must be alphanumeric.
pub fn validate_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let valid = !bytes.is_empty()
        && bytes.len() <= MAX_NAME_LEN
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"_.-".contains(b))
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric();

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidName(name.to_string()))
    }
}

/// Ownership label scheme for one orchestrator owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    owner: String,
}

impl Ownership {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Labels stamped on the image and container for `name`.
    pub fn labels_for(&self, name: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert(LABEL_CREATED_BY.to_string(), self.owner.clone());
        labels.insert(LABEL_LOGICAL_NAME.to_string(), name.to_string());
        labels
    }

    /// Filter selecting everything this owner manages.
    pub fn filter(&self) -> LabelFilter {
        LabelFilter::new().with(LABEL_CREATED_BY, self.owner.clone())
    }

    /// Filter selecting what this owner manages under `name`.
    pub fn filter_for(&self, name: &str) -> LabelFilter {
        self.filter().with(LABEL_LOGICAL_NAME, name)
    }

    /// Whether a label map carries this owner's label.
    pub fn owns(&self, labels: &Labels) -> bool {
        labels.get(LABEL_CREATED_BY) == Some(&self.owner)
    }

    /// Logical name of an owned entity.
    pub fn logical_name<'a>(&self, labels: &'a Labels) -> Option<&'a str> {
        if self.owns(labels) {
            labels.get(LABEL_LOGICAL_NAME).map(String::as_str)
        } else {
            None
        }
    }
}

/// Lifecycle state of a logical container as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Absent,
    Building,
    Running,
    /// Exists but is not executing (created, exited, paused or dead).
    Stopped,
    Stopping,
    Removed,
}

impl ContainerState {
    /// `Absent` and `Removed` both mean nothing is present.
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Absent | Self::Removed)
    }

    pub(crate) fn from_status(status: ContainerStatus) -> Self {
        if status.is_running() {
            Self::Running
        } else {
            Self::Stopped
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Building => write!(f, "building"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Stopping => write!(f, "stopping"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// A managed container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub name: String,
    pub container_id: Option<String>,
    pub image_id: Option<String>,
    pub state: ContainerState,
    /// Raw runtime status, absent while building.
    pub status: Option<ContainerStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub labels: Labels,
}

impl ContainerRecord {
    /// Convert an owned runtime container. Returns `None` for unlabeled ones.
    pub(crate) fn from_summary(ownership: &Ownership, c: &ContainerSummary) -> Option<Self> {
        let name = ownership.logical_name(&c.labels)?;
        Some(Self {
            name: name.to_string(),
            container_id: Some(c.id.clone()),
            image_id: (!c.image_id.is_empty()).then(|| c.image_id.clone()),
            state: ContainerState::from_status(c.status),
            status: Some(c.status),
            created_at: c.created_at,
            labels: c.labels.clone(),
        })
    }

    /// Placeholder for a name whose image is still being built.
    pub(crate) fn building(ownership: &Ownership, name: &str) -> Self {
        Self {
            name: name.to_string(),
            container_id: None,
            image_id: None,
            state: ContainerState::Building,
            status: None,
            created_at: None,
            labels: ownership.labels_for(name),
        }
    }
}

/// A managed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub image_id: String,
    pub tags: Vec<String>,
    pub logical_name: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub(crate) fn from_summary(ownership: &Ownership, i: &ImageSummary) -> Option<Self> {
        let name = ownership.logical_name(&i.labels)?;
        Some(Self {
            image_id: i.id.clone(),
            tags: i.tags.clone(),
            logical_name: name.to_string(),
            created_at: i.created_at,
        })
    }
}

/// Everything the orchestrator currently manages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedInventory {
    pub containers: Vec<ContainerRecord>,
    pub images: Vec<ImageRecord>,
}

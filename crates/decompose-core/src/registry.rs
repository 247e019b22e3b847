//! Build target discovery for bulk start/stop.

use crate::error::{CoreError, Result};
use crate::record::validate_name;
use async_trait::async_trait;
use decompose_runtime::BuildContextRef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A logical container name and the context its image is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    pub name: String,
    pub context: BuildContextRef,
}

impl BuildTarget {
    pub fn new(name: impl Into<String>, context: BuildContextRef) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }
}

/// Source of known build targets.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    /// All known targets, sorted by name.
    async fn targets(&self) -> Result<Vec<BuildTarget>>;

    /// Look up one target by name.
    async fn resolve(&self, name: &str) -> Result<Option<BuildTarget>> {
        Ok(self.targets().await?.into_iter().find(|t| t.name == name))
    }
}

/// Fixed manifest of targets.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    targets: Vec<BuildTarget>,
}

impl StaticRegistry {
    /// Create a registry from a manifest. Invalid names are dropped.
    pub fn new(targets: impl IntoIterator<Item = BuildTarget>) -> Self {
        let mut targets: Vec<BuildTarget> = targets
            .into_iter()
            .filter(|t| match validate_name(&t.name) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(name = %t.name, error = %e, "Skipping build target");
                    false
                }
            })
            .collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets.dedup_by(|a, b| a.name == b.name);
        Self { targets }
    }
}

#[async_trait]
impl TargetRegistry for StaticRegistry {
    async fn targets(&self) -> Result<Vec<BuildTarget>> {
        Ok(self.targets.clone())
    }
}

/// Treats every sub-directory of `root` as a target named after it.
#[derive(Debug, Clone)]
pub struct DirectoryRegistry {
    root: PathBuf,
}

impl DirectoryRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl TargetRegistry for DirectoryRegistry {
    async fn targets(&self) -> Result<Vec<BuildTarget>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            CoreError::Registry(format!("cannot read {}: {e}", self.root.display()))
        })?;

        let mut targets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::Registry(e.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!(path = %entry.path().display(), "Skipping non UTF-8 target directory");
                continue;
            };
            if let Err(e) = validate_name(&name) {
                tracing::warn!(name = %name, error = %e, "Skipping build target");
                continue;
            }

            targets.push(BuildTarget::new(
                name,
                BuildContextRef::from(entry.path().as_path()),
            ));
        }

        targets.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(root = %self.root.display(), count = targets.len(), "Discovered build targets");
        Ok(targets)
    }

    async fn resolve(&self, name: &str) -> Result<Option<BuildTarget>> {
        validate_name(name)?;
        let path = self.root.join(name);
        if tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            Ok(Some(BuildTarget::new(
                name,
                BuildContextRef::from(path.as_path()),
            )))
        } else {
            Ok(None)
        }
    }
}

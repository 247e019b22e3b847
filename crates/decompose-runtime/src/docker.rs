//! Docker implementation of [`ContainerRuntime`] over bollard.

use crate::error::{Result, RuntimeError};
use crate::types::{
    BuildContextRef, ContainerRuntime, ContainerStatus, ContainerSummary, ImageSummary,
    LabelFilter, Labels,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions, RemoveImageOptions};
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::path::Path;

/// Dockerfile name looked up inside each build context.
const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Container runtime backed by a Docker (or Docker-compatible) daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    dockerfile: String,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Wrap an existing bollard client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
        }
    }

    /// Use a different Dockerfile name inside build contexts.
    pub fn dockerfile(mut self, name: impl Into<String>) -> Self {
        self.dockerfile = name.into();
        self
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

/// Package a context directory as the tar stream the build API expects.
fn pack_context(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(RuntimeError::Context(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

/// Map daemon status codes onto the runtime taxonomy.
fn classify(err: bollard::errors::Error, subject: &str) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        other => RuntimeError::Docker(other),
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0)
}

fn container_from_docker(c: bollard::models::ContainerSummary) -> Option<ContainerSummary> {
    let id = c.id?;
    let name = c
        .names
        .unwrap_or_default()
        .into_iter()
        .next()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    Some(ContainerSummary {
        id,
        name,
        image_id: c.image_id.unwrap_or_default(),
        labels: c.labels.unwrap_or_default(),
        status: c
            .state
            .as_deref()
            .map(ContainerStatus::parse)
            .unwrap_or(ContainerStatus::Unknown),
        created_at: c.created.and_then(timestamp),
    })
}

fn image_from_docker(i: bollard::models::ImageSummary) -> ImageSummary {
    ImageSummary {
        id: i.id,
        tags: i.repo_tags,
        labels: i.labels,
        created_at: timestamp(i.created),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        context: &BuildContextRef,
        tag: &str,
        labels: &Labels,
    ) -> Result<String> {
        let start = std::time::Instant::now();
        tracing::debug!(tag, context = %context, "Packing build context");

        let dir = context.as_path().to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack_context(&dir))
            .await
            .map_err(|e| RuntimeError::Context(format!("context packing aborted: {e}")))??;

        let options = BuildImageOptions {
            dockerfile: self.dockerfile.clone(),
            t: tag.to_string(),
            rm: true,
            labels: labels.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(bytes::Bytes::from(archive)));

        let mut image_id = None;
        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| RuntimeError::Build(e.to_string()))?;
            if let Some(error) = info.error {
                tracing::debug!(tag, error = %error, "Build reported error");
                return Err(RuntimeError::Build(error));
            }
            if let Some(line) = info.stream.as_deref() {
                tracing::trace!(tag, line = line.trim_end(), "build output");
            }
            if let Some(id) = info.aux.and_then(|aux| aux.id) {
                image_id = Some(id);
            }
        }

        let image_id = match image_id {
            Some(id) => id,
            None => self
                .docker
                .inspect_image(tag)
                .await
                .map_err(|e| classify(e, tag))?
                .id
                .ok_or_else(|| RuntimeError::Build(format!("no image id reported for {tag}")))?,
        };

        tracing::info!(
            tag,
            image_id = %image_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Image built"
        );
        Ok(image_id)
    }

    async fn run_container(
        &self,
        image_id: &str,
        name: &str,
        labels: &Labels,
        network_mode: &str,
    ) -> Result<String> {
        let config = Config {
            image: Some(image_id.to_string()),
            tty: Some(true),
            labels: Some(labels.clone()),
            host_config: Some(HostConfig {
                network_mode: Some(network_mode.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| match classify(e, name) {
                RuntimeError::Conflict(_) => RuntimeError::NameConflict(name.to_string()),
                other => other,
            })?;
        let container_id = response.id;

        if let Err(e) = self
            .docker
            .start_container::<String>(&container_id, None)
            .await
        {
            // A created-but-never-started container would block the name.
            tracing::warn!(name, container_id = %container_id, error = %e, "Start failed, removing created container");
            let cleanup = self
                .docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            if let Err(cleanup_err) = cleanup {
                tracing::error!(name, container_id = %container_id, error = %cleanup_err, "Failed to remove unstarted container");
            }
            return Err(classify(e, name));
        }

        tracing::info!(name, container_id = %container_id, network_mode, "Container started");
        Ok(container_id)
    }

    async fn remove_container(&self, name_or_id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                name_or_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, name_or_id))?;
        tracing::debug!(container = name_or_id, "Container removed");
        Ok(())
    }

    async fn remove_image(&self, image_id: &str, force: bool) -> Result<()> {
        self.docker
            .remove_image(
                image_id,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map_err(|e| classify(e, image_id))?;
        tracing::debug!(image_id, "Image removed");
        Ok(())
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters: filter.to_docker_filters(),
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(RuntimeError::from)?;
        Ok(containers
            .into_iter()
            .filter_map(container_from_docker)
            .collect())
    }

    async fn list_images(&self, filter: &LabelFilter) -> Result<Vec<ImageSummary>> {
        let options = ListImagesOptions::<String> {
            all: false,
            filters: filter.to_docker_filters(),
            ..Default::default()
        };
        let images = self
            .docker
            .list_images(Some(options))
            .await
            .map_err(RuntimeError::from)?;
        Ok(images.into_iter().map(image_from_docker).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_context_rejects_missing_dir() {
        let result = pack_context(Path::new("/no/such/context/dir"));
        assert!(matches!(result, Err(RuntimeError::Context(_))));
    }

    #[test]
    fn test_pack_context_archives_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

        let archive = pack_context(dir.path()).unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let names: Vec<String> = reader
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("Dockerfile")));
    }

    #[test]
    fn test_classify_status_codes() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(classify(not_found, "x"), RuntimeError::NotFound(s) if s == "x"));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "image is in use".into(),
        };
        assert!(matches!(classify(conflict, "x"), RuntimeError::Conflict(_)));

        let other = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(matches!(classify(other, "x"), RuntimeError::Docker(_)));
    }

    #[test]
    fn test_container_conversion_strips_slash() {
        let c = bollard::models::ContainerSummary {
            id: Some("abc".into()),
            names: Some(vec!["/scan-a".into()]),
            image_id: Some("sha256:1".into()),
            state: Some("running".into()),
            created: Some(0),
            ..Default::default()
        };
        let summary = container_from_docker(c).unwrap();
        assert_eq!(summary.name, "scan-a");
        assert_eq!(summary.status, ContainerStatus::Running);
        assert!(summary.labels.is_empty());
    }
}

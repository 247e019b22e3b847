//! # decompose-runtime
//!
//! Container runtime client for decompose.
//! Provides the [`ContainerRuntime`] capability the orchestrator is built
//! against, with a Docker implementation over bollard and an in-memory
//! implementation for tests and daemon-less development.
//!
//! ## Quick Start
//!
//! ```no_run
//! use decompose_runtime::{BuildContextRef, ContainerRuntime, DockerRuntime, LabelFilter, Labels};
//!
//! # async fn example() -> decompose_runtime::Result<()> {
//! let runtime = DockerRuntime::connect()?;
//!
//! let mut labels = Labels::new();
//! labels.insert("decompose.created_by".into(), "decompose".into());
//!
//! let image = runtime
//!     .build_image(&BuildContextRef::new("/test_images/scan-a"), "scan-a", &labels)
//!     .await?;
//! let container = runtime
//!     .run_container(&image, "scan-a", &labels, "bridge")
//!     .await?;
//!
//! let managed = runtime
//!     .list_containers(&LabelFilter::new().with("decompose.created_by", "decompose"))
//!     .await?;
//! assert!(managed.iter().any(|c| c.id == container));
//!
//! runtime.remove_container(&container, true).await?;
//! runtime.remove_image(&image, true).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Image builds**: build a tagged, labeled image from a context directory
//! - **Container runs**: detached, TTY-attached, explicit network mode
//! - **Labeled discovery**: list containers and images by label filter
//! - **Teardown**: forced container and image removal
//! - **In-memory runtime**: deterministic fake with race and failure hooks

mod docker;
mod error;
mod memory;
mod types;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use memory::MemoryRuntime;
pub use types::{
    BuildContextRef, ContainerRuntime, ContainerStatus, ContainerSummary, ImageSummary,
    LabelFilter, Labels,
};

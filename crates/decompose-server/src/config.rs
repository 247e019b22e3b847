//! Configuration for the decompose server.
//!
//! Configuration is loaded from environment variables with sensible defaults.

use decompose_core::{OrchestratorConfig, QueueConfig, RetryPolicy, WorkerConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which container runtime backs the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeKind {
    /// Docker daemon via `DOCKER_HOST` or the default socket (default)
    #[default]
    Docker,
    /// In-process runtime, no daemon required
    Memory,
}

impl RuntimeKind {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "mem" | "fake" => Self::Memory,
            _ => Self::Docker,
        }
    }
}

/// Configuration for the decompose server.
#[derive(Debug, Clone)]
pub struct DecomposeConfig {
    /// HTTP server bind address.
    pub http_addr: SocketAddr,

    /// Container runtime (default: docker).
    pub runtime: RuntimeKind,

    /// Directory whose sub-directories are build targets.
    pub targets_dir: PathBuf,

    /// Dockerfile name inside each build context (default: Dockerfile).
    pub dockerfile: String,

    /// Ownership label value (default: decompose).
    pub owner: String,

    /// Network mode for started containers.
    pub network_mode: String,

    /// Image build timeout (default: 600s).
    pub build_timeout: Duration,

    /// Timeout for other runtime calls (default: 30s).
    pub call_timeout: Duration,

    /// Force image removal on teardown (default: true).
    pub force_image_removal: bool,

    /// Concurrency of synchronous bulk operations (default: 4).
    pub bulk_concurrency: usize,

    /// Minimum image age before reclaim may remove it (default: 300s).
    pub image_reclaim_grace: Duration,

    /// Number of workers (default: 4).
    pub workers: usize,

    /// Queue capacity (default: 1024).
    pub queue_capacity: usize,

    /// Job lease timeout (default: 900s).
    pub lease_timeout: Duration,

    /// Attempts to record a completion (default: 5).
    pub sink_max_attempts: u32,

    /// Postgres URL for the completion store. In-memory store when unset.
    pub database_url: Option<String>,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("targets directory not found: {0}")]
    MissingTargets(PathBuf),
}

impl Default for DecomposeConfig {
    fn default() -> Self {
        let orchestrator = OrchestratorConfig::default();
        let queue = QueueConfig::default();
        let worker = WorkerConfig::default();
        Self {
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8080),
            runtime: RuntimeKind::Docker,
            targets_dir: PathBuf::from("/var/lib/decompose/targets"),
            dockerfile: "Dockerfile".to_string(),
            owner: orchestrator.owner,
            network_mode: orchestrator.network_mode,
            build_timeout: orchestrator.build_timeout,
            call_timeout: orchestrator.call_timeout,
            force_image_removal: orchestrator.force_image_removal,
            bulk_concurrency: orchestrator.bulk_concurrency,
            image_reclaim_grace: orchestrator.image_reclaim_grace,
            workers: worker.workers,
            queue_capacity: queue.capacity,
            lease_timeout: queue.lease_timeout,
            sink_max_attempts: worker.retry.max_attempts,
            database_url: None,
        }
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn secs_or(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

impl DecomposeConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `DECOMPOSE_HTTP_HOST` | `0.0.0.0` |
    /// | `DECOMPOSE_HTTP_PORT` | `8080` |
    /// | `DECOMPOSE_RUNTIME` | `docker` (docker, memory) |
    /// | `DECOMPOSE_TARGETS_DIR` | `/var/lib/decompose/targets` |
    /// | `DECOMPOSE_DOCKERFILE` | `Dockerfile` |
    /// | `DECOMPOSE_OWNER` | `decompose` |
    /// | `DECOMPOSE_NETWORK_MODE` | `container:$HOSTNAME`, else `bridge` |
    /// | `DECOMPOSE_BUILD_TIMEOUT_SECS` | `600` |
    /// | `DECOMPOSE_CALL_TIMEOUT_SECS` | `30` |
    /// | `DECOMPOSE_FORCE_IMAGE_REMOVAL` | `true` |
    /// | `DECOMPOSE_BULK_CONCURRENCY` | `4` |
    /// | `DECOMPOSE_IMAGE_RECLAIM_GRACE_SECS` | `300` |
    /// | `DECOMPOSE_WORKERS` | `4` |
    /// | `DECOMPOSE_QUEUE_CAPACITY` | `1024` |
    /// | `DECOMPOSE_LEASE_TIMEOUT_SECS` | `900` |
    /// | `DECOMPOSE_SINK_MAX_ATTEMPTS` | `5` |
    /// | `DATABASE_URL` | unset (in-memory completion store) |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let http_host: IpAddr = parse_or(get("DECOMPOSE_HTTP_HOST"), default.http_addr.ip());
        let http_port: u16 = parse_or(get("DECOMPOSE_HTTP_PORT"), default.http_addr.port());

        // Share the orchestrator's own network namespace when it runs in a
        // container, so targets can reach the API on localhost.
        let network_mode = get("DECOMPOSE_NETWORK_MODE")
            .filter(|v| !v.trim().is_empty())
            .or_else(|| {
                get("HOSTNAME")
                    .filter(|v| !v.trim().is_empty())
                    .map(|h| format!("container:{h}"))
            })
            .unwrap_or(default.network_mode);

        Self {
            http_addr: SocketAddr::new(http_host, http_port),
            runtime: get("DECOMPOSE_RUNTIME")
                .map(|v| RuntimeKind::parse(&v))
                .unwrap_or(default.runtime),
            targets_dir: get("DECOMPOSE_TARGETS_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.targets_dir),
            dockerfile: get("DECOMPOSE_DOCKERFILE").unwrap_or(default.dockerfile),
            owner: get("DECOMPOSE_OWNER").unwrap_or(default.owner),
            network_mode,
            build_timeout: secs_or(get("DECOMPOSE_BUILD_TIMEOUT_SECS"), default.build_timeout),
            call_timeout: secs_or(get("DECOMPOSE_CALL_TIMEOUT_SECS"), default.call_timeout),
            force_image_removal: get("DECOMPOSE_FORCE_IMAGE_REMOVAL")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.force_image_removal),
            bulk_concurrency: parse_or(get("DECOMPOSE_BULK_CONCURRENCY"), default.bulk_concurrency),
            image_reclaim_grace: secs_or(
                get("DECOMPOSE_IMAGE_RECLAIM_GRACE_SECS"),
                default.image_reclaim_grace,
            ),
            workers: parse_or(get("DECOMPOSE_WORKERS"), default.workers),
            queue_capacity: parse_or(get("DECOMPOSE_QUEUE_CAPACITY"), default.queue_capacity),
            lease_timeout: secs_or(get("DECOMPOSE_LEASE_TIMEOUT_SECS"), default.lease_timeout),
            sink_max_attempts: parse_or(
                get("DECOMPOSE_SINK_MAX_ATTEMPTS"),
                default.sink_max_attempts,
            ),
            database_url: get("DATABASE_URL").filter(|v| !v.trim().is_empty()),
        }
    }

    /// Validate values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.owner.trim().is_empty() {
            return Err(ConfigError::Empty("DECOMPOSE_OWNER"));
        }
        if self.network_mode.trim().is_empty() {
            return Err(ConfigError::Empty("DECOMPOSE_NETWORK_MODE"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Zero("DECOMPOSE_WORKERS"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("DECOMPOSE_QUEUE_CAPACITY"));
        }
        if self.bulk_concurrency == 0 {
            return Err(ConfigError::Zero("DECOMPOSE_BULK_CONCURRENCY"));
        }
        if self.build_timeout.is_zero() {
            return Err(ConfigError::Zero("DECOMPOSE_BUILD_TIMEOUT_SECS"));
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigError::Zero("DECOMPOSE_CALL_TIMEOUT_SECS"));
        }
        if self.lease_timeout.is_zero() {
            return Err(ConfigError::Zero("DECOMPOSE_LEASE_TIMEOUT_SECS"));
        }
        Ok(())
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where paths may not exist yet.
    pub fn validate_warn(&self) {
        if !self.targets_dir.is_dir() {
            tracing::warn!(
                "{}",
                ConfigError::MissingTargets(self.targets_dir.clone())
            );
        }
        if self.database_url.is_none() {
            tracing::warn!("DATABASE_URL not set, completions are kept in memory only");
        }
        if self.lease_timeout <= self.build_timeout {
            tracing::warn!(
                lease_timeout_secs = self.lease_timeout.as_secs(),
                build_timeout_secs = self.build_timeout.as_secs(),
                "Lease timeout does not exceed build timeout, slow builds may be redelivered"
            );
        }
    }

    /// Orchestrator settings.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            owner: self.owner.clone(),
            network_mode: self.network_mode.clone(),
            build_timeout: self.build_timeout,
            call_timeout: self.call_timeout,
            force_image_removal: self.force_image_removal,
            bulk_concurrency: self.bulk_concurrency,
            image_reclaim_grace: self.image_reclaim_grace,
        }
    }

    /// Queue settings.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue_capacity,
            lease_timeout: self.lease_timeout,
        }
    }

    /// Worker pool settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            retry: RetryPolicy {
                max_attempts: self.sink_max_attempts,
                ..RetryPolicy::default()
            },
            ..WorkerConfig::default()
        }
    }
}

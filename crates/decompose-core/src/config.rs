//! Orchestrator configuration types.

use crate::error::CoreError;
use std::time::Duration;

/// Label key carrying the owner of a container or image.
pub const LABEL_CREATED_BY: &str = "decompose.created_by";

/// Label key carrying the logical name of a container or image.
pub const LABEL_LOGICAL_NAME: &str = "decompose.logical_name";

/// Configuration for the container lifecycle orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Value of the `decompose.created_by` label (default: "decompose").
    pub owner: String,
    /// Network mode for started containers, e.g. `container:<self>`.
    pub network_mode: String,
    /// Upper bound for a single image build (default: 10 minutes).
    pub build_timeout: Duration,
    /// Upper bound for every other runtime call (default: 30 seconds).
    pub call_timeout: Duration,
    /// Force image removal during teardown (default: true).
    pub force_image_removal: bool,
    /// Concurrent items in start-all / stop-all (default: 4).
    pub bulk_concurrency: usize,
    /// Managed images younger than this are never reclaimed, so a build
    /// another process has not run yet survives (default: 5 minutes).
    pub image_reclaim_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            owner: "decompose".to_string(),
            network_mode: "bridge".to_string(),
            build_timeout: Duration::from_secs(600),
            call_timeout: Duration::from_secs(30),
            force_image_removal: true,
            bulk_concurrency: 4,
            image_reclaim_grace: Duration::from_secs(300),
        }
    }
}

impl OrchestratorConfig {
    /// Create a new config builder.
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.owner.trim().is_empty() {
            return Err(CoreError::Config("owner must not be empty".into()));
        }
        if self.network_mode.trim().is_empty() {
            return Err(CoreError::Config("network_mode must not be empty".into()));
        }
        if self.build_timeout.is_zero() {
            return Err(CoreError::Config("build_timeout must be > 0".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(CoreError::Config("call_timeout must be > 0".into()));
        }
        if self.bulk_concurrency == 0 {
            return Err(CoreError::Config("bulk_concurrency must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for OrchestratorConfig.
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Set the ownership label value.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = owner.into();
        self
    }

    /// Set the network mode for started containers.
    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.config.network_mode = mode.into();
        self
    }

    /// Set the image build timeout.
    pub fn build_timeout(mut self, timeout: Duration) -> Self {
        self.config.build_timeout = timeout;
        self
    }

    /// Set the timeout for non-build runtime calls.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set whether teardown force-removes images.
    pub fn force_image_removal(mut self, force: bool) -> Self {
        self.config.force_image_removal = force;
        self
    }

    /// Set bulk operation concurrency.
    pub fn bulk_concurrency(mut self, n: usize) -> Self {
        self.config.bulk_concurrency = n;
        self
    }

    /// Set the minimum age of images eligible for reclaim.
    pub fn image_reclaim_grace(mut self, grace: Duration) -> Self {
        self.config.image_reclaim_grace = grace;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<OrchestratorConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Bounded exponential backoff used when recording completions.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (default: 5).
    pub max_attempts: u32,
    /// Delay after the first failure (default: 100ms).
    pub initial_backoff: Duration,
    /// Ceiling for any single delay (default: 5 seconds).
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.owner, "decompose");
        assert_eq!(config.network_mode, "bridge");
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert!(config.force_image_removal);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_empty_owner() {
        let result = OrchestratorConfig::builder().owner("  ").build();
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let result = OrchestratorConfig::builder().bulk_concurrency(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = OrchestratorConfig::builder()
            .owner("scanner")
            .network_mode("container:api")
            .build_timeout(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.owner, "scanner");
        assert_eq!(config.network_mode, "container:api");
        assert_eq!(config.build_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}

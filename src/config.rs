use crate::error::{DocflowError, Result};
use crate::pool::PoolConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Runtime configuration for the orchestration core.
///
/// Lease policy: a claimed task holds its lease for `lease_duration` and the
/// lease is renewed on every successful step checkpoint. There is no mid-step
/// heartbeat; a worker that dies mid-step lets the lease lapse so the
/// recovery scan can re-admit the task.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Global ceiling on concurrently RUNNING tasks across all workers.
    pub max_concurrent_tasks: usize,
    /// How long a claim lease lasts before an unrenewed task is presumed crashed.
    pub lease_duration: Duration,
    /// Number of polling worker loops.
    pub worker_count: usize,
    /// Sleep between empty claim polls.
    pub poll_interval: Duration,
    /// Interval of the expired-lease recovery scan.
    pub recovery_interval: Duration,
    /// Terminal tasks older than this are purged by the retention sweep.
    pub retention_window: Duration,
    /// Interval of the retention sweep.
    pub retention_sweep_interval: Duration,
    /// Per-step attempt cap; at the cap a transient failure becomes terminal.
    pub max_step_attempts: u32,
    /// Resource pools by name.
    pub pools: HashMap<String, PoolConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut pools = HashMap::new();
        pools.insert("content_update".to_string(), PoolConfig::new(8));
        pools.insert("admin".to_string(), PoolConfig::new(4));
        pools.insert("analytics".to_string(), PoolConfig::new(6));

        Self {
            max_concurrent_tasks: 4,
            lease_duration: Duration::from_secs(30),
            worker_count: 2,
            poll_interval: Duration::from_millis(500),
            recovery_interval: Duration::from_secs(30),
            retention_window: Duration::from_secs(7 * 24 * 3600),
            retention_sweep_interval: Duration::from_secs(3600),
            max_step_attempts: 25,
            pools,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(max_concurrent) = std::env::var("DOCFLOW_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = max_concurrent.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid max_concurrent_tasks: {e}"))
            })?;
        }

        if let Ok(lease_secs) = std::env::var("DOCFLOW_LEASE_SECONDS") {
            let secs: u64 = lease_secs.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid lease_duration: {e}"))
            })?;
            config.lease_duration = Duration::from_secs(secs);
        }

        if let Ok(workers) = std::env::var("DOCFLOW_WORKER_COUNT") {
            config.worker_count = workers.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid worker_count: {e}"))
            })?;
        }

        if let Ok(poll_ms) = std::env::var("DOCFLOW_POLL_INTERVAL_MS") {
            let ms: u64 = poll_ms.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid poll_interval: {e}"))
            })?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(attempts) = std::env::var("DOCFLOW_MAX_STEP_ATTEMPTS") {
            config.max_step_attempts = attempts.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid max_step_attempts: {e}"))
            })?;
        }

        if let Ok(retention_days) = std::env::var("DOCFLOW_TASK_RETENTION_DAYS") {
            let days: u64 = retention_days.parse().map_err(|e| {
                DocflowError::ConfigurationError(format!("Invalid retention_window: {e}"))
            })?;
            config.retention_window = Duration::from_secs(days * 24 * 3600);
        }

        for (pool, env_name) in [
            ("content_update", "DOCFLOW_CONTENT_UPDATE_POOL_SIZE"),
            ("admin", "DOCFLOW_ADMIN_POOL_SIZE"),
            ("analytics", "DOCFLOW_ANALYTICS_POOL_SIZE"),
        ] {
            if let Ok(size) = std::env::var(env_name) {
                let max_workers: usize = size.parse().map_err(|e| {
                    DocflowError::ConfigurationError(format!("Invalid {env_name}: {e}"))
                })?;
                config
                    .pools
                    .insert(pool.to_string(), PoolConfig::new(max_workers));
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(DocflowError::ConfigurationError(
                "max_concurrent_tasks must be greater than 0".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(DocflowError::ConfigurationError(
                "worker_count must be greater than 0".to_string(),
            ));
        }
        if self.lease_duration.is_zero() {
            return Err(DocflowError::ConfigurationError(
                "lease_duration must be non-zero".to_string(),
            ));
        }
        for (name, pool) in &self.pools {
            if pool.max_workers == 0 {
                return Err(DocflowError::ConfigurationError(format!(
                    "pool '{name}' must have at least one worker"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert_eq!(config.pools.len(), 3);
        assert_eq!(config.pools["content_update"].max_workers, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_ceiling() {
        let config = OrchestratorConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DocflowError::ConfigurationError(_))
        ));
    }
}

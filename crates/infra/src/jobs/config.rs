//! Queue configuration.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use steward_core::TypePolicy;

use crate::config::ConfigError;

/// Job queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs fetched per collector sweep.
    pub collect_jobs: usize,
    /// Sweep period, in milliseconds.
    pub collect_period_ms: u64,
    /// Inbound channel capacity per worker.
    pub worker_buf_len: usize,
    /// Worker count; 0 means the number of CPUs.
    pub workers: usize,
    /// Policy for job types without an override.
    pub default: TypePolicy,
    /// Per-type overrides.
    pub types: HashMap<String, TypePolicy>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            collect_jobs: 100,
            collect_period_ms: 1000,
            worker_buf_len: 10,
            workers: 0,
            default: TypePolicy::default(),
            types: HashMap::new(),
        }
    }
}

impl QueueConfig {
    /// Load a standalone queue configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        crate::config::read_json(path.as_ref())
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_collect_period(mut self, period: Duration) -> Self {
        self.collect_period_ms = period.as_millis() as u64;
        self
    }

    pub fn with_collect_jobs(mut self, jobs: usize) -> Self {
        self.collect_jobs = jobs;
        self
    }

    pub fn with_worker_buf_len(mut self, len: usize) -> Self {
        self.worker_buf_len = len;
        self
    }

    pub fn with_default(mut self, policy: TypePolicy) -> Self {
        self.default = policy;
        self
    }

    pub fn with_type(mut self, job_type: impl Into<String>, policy: TypePolicy) -> Self {
        self.types.insert(job_type.into(), policy);
        self
    }

    /// Policy in effect for a job type.
    pub fn policy_for(&self, job_type: &str) -> &TypePolicy {
        self.types.get(job_type).unwrap_or(&self.default)
    }

    pub fn collect_period(&self) -> Duration {
        Duration::from_millis(self.collect_period_ms)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub(crate) fn channel_capacity(&self) -> usize {
        self.worker_buf_len.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.collect_jobs, 100);
        assert_eq!(config.collect_period(), Duration::from_secs(1));
        assert_eq!(config.worker_buf_len, 10);
        assert_eq!(config.workers, 0);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn type_override_wins_over_default() {
        let config = QueueConfig::default()
            .with_type("fast", TypePolicy::fixed(1, Duration::from_millis(10)));
        assert_eq!(config.policy_for("fast").try_limit, 1);
        assert_eq!(config.policy_for("other").try_limit, 3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: QueueConfig = serde_json::from_str(
            r#"{"workers": 4, "types": {"ping": {"duplicated": true}}}"#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.collect_jobs, 100);
        let ping = config.policy_for("ping");
        assert!(ping.duplicated);
        assert_eq!(ping.try_limit, 3);
    }

    #[test]
    fn zero_buffer_still_gets_a_channel_slot() {
        let config = QueueConfig::default().with_worker_buf_len(0);
        assert_eq!(config.channel_capacity(), 1);
    }
}

//! Per-job-type execution policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the retry delay grows with the number of failed attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay after every failure.
    #[default]
    Fixed,
    /// base * attempt
    Linear,
    /// base * 2^(attempt - 1)
    Exponential,
}

/// Retry and enqueue behaviour for one job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypePolicy {
    /// Failed attempts before the job becomes `Failed` (0 = unlimited).
    pub try_limit: u32,
    /// Base delay before a failed job is retried.
    pub try_period_ms: u64,
    /// Several active jobs of this type may exist for one entity.
    pub duplicated: bool,
    /// Delay applied to `not_before` when the job is enqueued.
    pub first_start_delay_ms: u64,
    pub backoff: BackoffStrategy,
    /// Upper bound on the retry delay for growing strategies.
    pub max_try_period_ms: Option<u64>,
}

impl Default for TypePolicy {
    fn default() -> Self {
        Self {
            try_limit: 3,
            try_period_ms: 60_000,
            duplicated: false,
            first_start_delay_ms: 0,
            backoff: BackoffStrategy::Fixed,
            max_try_period_ms: None,
        }
    }
}

impl TypePolicy {
    /// Fixed retry period with the given limit.
    pub fn fixed(try_limit: u32, try_period: Duration) -> Self {
        Self {
            try_limit,
            try_period_ms: try_period.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy, max: Option<Duration>) -> Self {
        self.backoff = backoff;
        self.max_try_period_ms = max.map(|d| d.as_millis() as u64);
        self
    }

    pub fn allow_duplicates(mut self) -> Self {
        self.duplicated = true;
        self
    }

    pub fn with_first_start_delay(mut self, delay: Duration) -> Self {
        self.first_start_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn first_start_delay(&self) -> Duration {
        Duration::from_millis(self.first_start_delay_ms)
    }

    /// True once `try_count` failed attempts exhaust the limit.
    pub fn is_exhausted(&self, try_count: u32) -> bool {
        self.try_limit != 0 && try_count >= self.try_limit
    }

    /// Delay before the next attempt after `try_count` failures (1-indexed).
    pub fn retry_delay(&self, try_count: u32) -> Duration {
        let base = self.try_period_ms;
        let attempt = try_count.max(1);
        let ms = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };
        let ms = match self.max_try_period_ms {
            Some(max) => ms.min(max),
            None => ms,
        };
        Duration::from_millis(ms)
    }
}

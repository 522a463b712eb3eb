//! The persisted job record and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::policy::TypePolicy;

/// Who created a job.
pub mod creators {
    pub const USER: &str = "user";
    pub const BILLING_CHECKER: &str = "billing_checker";
    pub const BC_MONITOR: &str = "bc_monitor";
    pub const TASK: &str = "task";
    pub const SERVICE_ADAPTER: &str = "service_adapter";
    pub const SESSION_SERVER: &str = "session_server";
}

/// Kinds of business entity a job can act upon.
pub mod related {
    pub const OFFERING: &str = "offering";
    pub const CHANNEL: &str = "channel";
    pub const ENDPOINT: &str = "endpoint";
    pub const ACCOUNT: &str = "account";
}

/// Service-lifecycle job types driven through the transition guard.
pub mod types {
    pub const AGENT_PRE_SERVICE_SUSPEND: &str = "agentPreServiceSuspend";
    pub const AGENT_PRE_SERVICE_UNSUSPEND: &str = "agentPreServiceUnsuspend";
    pub const AGENT_PRE_SERVICE_TERMINATE: &str = "agentPreServiceTerminate";
    pub const CLIENT_PRE_SERVICE_SUSPEND: &str = "clientPreServiceSuspend";
    pub const CLIENT_PRE_SERVICE_UNSUSPEND: &str = "clientPreServiceUnsuspend";
    pub const CLIENT_PRE_SERVICE_TERMINATE: &str = "clientPreServiceTerminate";
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for (re)execution.
    Active,
    /// Handler succeeded.
    Done,
    /// Retry limit exhausted.
    Failed,
    /// Superseded by an external actor.
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "active",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses are never left by the scheduler itself.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(DomainError::unknown_status("job", other)),
        }
    }
}

/// A unit of work acting on one business entity.
///
/// `related_id` is the unit of serialization: every job sharing it is executed
/// by the same worker, one at a time, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub related_type: String,
    pub related_id: String,
    pub status: JobStatus,
    /// Number of failed attempts so far.
    pub try_count: u32,
    /// The job is not dispatched before this instant.
    pub not_before: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    /// Opaque payload, interpreted by the business handler only.
    pub data: serde_json::Value,
}

impl Job {
    /// Create a new active job with an empty payload.
    pub fn new(
        job_type: impl Into<String>,
        related_type: impl Into<String>,
        related_id: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            related_type: related_type.into(),
            related_id: related_id.into(),
            status: JobStatus::Active,
            try_count: 0,
            not_before: now,
            created_at: now,
            created_by: created_by.into(),
            data: serde_json::json!({}),
        }
    }

    /// Attach a raw JSON payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Serialize a typed payload into the job.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> DomainResult<Self> {
        self.data = serde_json::to_value(payload)
            .map_err(|e| DomainError::validation(format!("job payload: {e}")))?;
        Ok(self)
    }

    /// Schedule the job for a specific instant.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = at;
        self
    }

    /// Schedule the job with a delay from now.
    pub fn delayed(mut self, delay: std::time::Duration) -> Self {
        self.not_before = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
        self
    }

    /// Decode the payload into a typed value.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| DomainError::validation(format!("job payload: {e}")))
    }

    /// External transaction hash embedded by the blockchain monitor, if any.
    ///
    /// Jobs of the same type and entity that carry distinct hashes are treated
    /// as distinct work (e.g. a fee-bumped resubmission), not duplicates.
    pub fn external_tx_id(&self) -> Option<&str> {
        self.data
            .get("ethereumLog")?
            .get("transactionHash")?
            .as_str()
            .filter(|hash| !hash.is_empty())
    }

    /// Active and due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.not_before <= now
    }

    pub fn mark_done(&mut self) {
        self.status = JobStatus::Done;
    }

    pub fn mark_canceled(&mut self) {
        self.status = JobStatus::Canceled;
    }

    /// Apply a failed attempt under `policy`.
    ///
    /// Returns `true` when the job ran out of tries and is now `Failed`;
    /// otherwise it stays `Active` with `not_before` pushed into the future.
    pub fn record_failure(&mut self, policy: &TypePolicy, now: DateTime<Utc>) -> bool {
        self.try_count = self.try_count.saturating_add(1);
        if policy.is_exhausted(self.try_count) {
            self.status = JobStatus::Failed;
            return true;
        }
        let delay = chrono::Duration::from_std(policy.retry_delay(self.try_count))
            .unwrap_or(chrono::Duration::MAX);
        self.not_before = now
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_job() -> Job {
        Job::new("test", related::CHANNEL, "e1", creators::USER)
    }

    #[test]
    fn new_job_is_active_and_due() {
        let job = test_job();
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.try_count, 0);
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn delayed_job_is_not_due() {
        let job = test_job().delayed(Duration::from_secs(60));
        assert!(!job.is_due(Utc::now()));
    }

    #[test]
    fn status_parses_its_own_display() {
        for status in [
            JobStatus::Active,
            JobStatus::Done,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn external_tx_id_is_read_from_ethereum_log() {
        let job = test_job().with_data(serde_json::json!({
            "ethereumLog": { "block": 7, "transactionHash": "0xabc" }
        }));
        assert_eq!(job.external_tx_id(), Some("0xabc"));

        assert_eq!(test_job().external_tx_id(), None);
        let empty = test_job().with_data(serde_json::json!({
            "ethereumLog": { "transactionHash": "" }
        }));
        assert_eq!(empty.external_tx_id(), None);
    }

    #[test]
    fn failure_reschedules_until_limit() {
        let policy = TypePolicy::fixed(3, Duration::from_millis(500));
        let mut job = test_job();
        let now = Utc::now();

        assert!(!job.record_failure(&policy, now));
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.try_count, 1);
        assert_eq!(job.not_before, now + chrono::Duration::milliseconds(500));

        assert!(!job.record_failure(&policy, now));
        assert!(job.record_failure(&policy, now));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.try_count, 3);
    }

    #[test]
    fn zero_try_limit_never_fails() {
        let policy = TypePolicy::fixed(0, Duration::ZERO);
        let mut job = test_job();
        for _ in 0..50 {
            assert!(!job.record_failure(&policy, Utc::now()));
        }
        assert_eq!(job.status, JobStatus::Active);
        assert_eq!(job.try_count, 50);
    }

    #[test]
    fn serializes_type_field_under_its_wire_name() {
        let value = serde_json::to_value(test_job()).unwrap();
        assert_eq!(value["type"], "test");
        assert_eq!(value["status"], "active");
    }
}

//! Storage ports for jobs and guarded entities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use steward_core::{Job, JobId, ServiceStatus};

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job persistence.
///
/// Mutations go through a transaction obtained from [`JobStore::begin`].
/// Dropping a transaction without committing it rolls it back.
#[async_trait]
pub trait JobStore: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Insert a new job row.
    async fn insert_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job outside of any transaction.
    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Fetch a job and hold its row lock until the transaction ends.
    async fn find_job_for_update(
        &self,
        tx: &mut Self::Tx,
        id: JobId,
    ) -> Result<Option<Job>, StoreError>;

    /// Overwrite an existing job row.
    async fn save_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError>;

    /// Block other transactions enqueueing the same `(related_id, job_type)`
    /// until this transaction ends, so their duplicate checks run one after
    /// the other.
    async fn lock_job_slot(
        &self,
        tx: &mut Self::Tx,
        related_id: &str,
        job_type: &str,
    ) -> Result<(), StoreError>;

    /// Active jobs of an entity, optionally restricted to one type.
    async fn active_jobs(
        &self,
        tx: &mut Self::Tx,
        related_id: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError>;

    /// Cancel every active job of an entity. Returns the number of rows changed.
    async fn cancel_active_jobs(&self, tx: &mut Self::Tx, related_id: &str)
    -> Result<u64, StoreError>;

    /// Collector query.
    ///
    /// For each entity, takes its oldest active job (by `created_at`, then id)
    /// and keeps it only if its `not_before` has elapsed at `now`. At most
    /// `limit` jobs are returned.
    async fn collect(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Every job of an entity, oldest first.
    async fn jobs_for(&self, related_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Reset `Failed` jobs of a type back to `Active` with `try_count = 0`.
    async fn reactivate_failed(&self, job_type: &str) -> Result<u64, StoreError>;
}

/// Storage of the entities whose lifecycle is guarded by transitions.
#[async_trait]
pub trait ServiceStore: JobStore {
    /// Lock the entity row and return its service status.
    async fn lock_service_status(
        &self,
        tx: &mut Self::Tx,
        entity_id: &str,
    ) -> Result<Option<ServiceStatus>, StoreError>;

    /// Create or update the entity's service status.
    async fn set_service_status(
        &self,
        tx: &mut Self::Tx,
        entity_id: &str,
        status: ServiceStatus,
    ) -> Result<(), StoreError>;
}

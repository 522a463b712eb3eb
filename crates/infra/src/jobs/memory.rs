//! In-memory job store for tests/dev.
//!
//! A transaction holds the store's single lock for its whole lifetime, so
//! transactions are serialized; that is what gives `find_job_for_update` and
//! `lock_service_status` their row-lock semantics here. A snapshot taken at
//! `begin` is restored on rollback or when the transaction is dropped
//! uncommitted.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use steward_core::{Job, JobId, JobStatus, ServiceStatus};

use super::store::{JobStore, ServiceStore, StoreError};

#[derive(Debug, Clone, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    services: HashMap<String, ServiceStatus>,
}

impl State {
    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    fn active_for(&self, related_id: &str) -> impl Iterator<Item = &Job> {
        self.jobs
            .values()
            .filter(move |j| j.status == JobStatus::Active && j.related_id == related_id)
    }
}

/// Open transaction on an [`InMemoryJobStore`].
pub struct MemoryTx {
    state: OwnedMutexGuard<State>,
    snapshot: Option<State>,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.state = snapshot;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs, regardless of status.
    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, StoreError> {
        let state = self.state.clone().lock_owned().await;
        let snapshot = Some(state.clone());
        Ok(MemoryTx { state, snapshot })
    }

    async fn commit(&self, mut tx: MemoryTx) -> Result<(), StoreError> {
        tx.snapshot = None;
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn insert_job(&self, tx: &mut MemoryTx, job: &Job) -> Result<(), StoreError> {
        if tx.state.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        tx.state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn find_job_for_update(
        &self,
        tx: &mut MemoryTx,
        id: JobId,
    ) -> Result<Option<Job>, StoreError> {
        Ok(tx.state.jobs.get(&id).cloned())
    }

    async fn save_job(&self, tx: &mut MemoryTx, job: &Job) -> Result<(), StoreError> {
        match tx.state.jobs.get_mut(&job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(job.id)),
        }
    }

    // Transactions already hold the whole store exclusively.
    async fn lock_job_slot(
        &self,
        _tx: &mut MemoryTx,
        _related_id: &str,
        _job_type: &str,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn active_jobs(
        &self,
        tx: &mut MemoryTx,
        related_id: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = tx
            .state
            .active_for(related_id)
            .filter(|j| job_type.is_none_or(|t| j.job_type == t))
            .cloned()
            .collect();
        Ok(State::sorted(jobs))
    }

    async fn cancel_active_jobs(
        &self,
        tx: &mut MemoryTx,
        related_id: &str,
    ) -> Result<u64, StoreError> {
        let mut canceled = 0;
        for job in tx.state.jobs.values_mut() {
            if job.status == JobStatus::Active && job.related_id == related_id {
                job.mark_canceled();
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn collect(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;

        let mut oldest: HashMap<&str, &Job> = HashMap::new();
        for job in state.jobs.values().filter(|j| j.status == JobStatus::Active) {
            oldest
                .entry(job.related_id.as_str())
                .and_modify(|current| {
                    if (job.created_at, job.id) < (current.created_at, current.id) {
                        *current = job;
                    }
                })
                .or_insert(job);
        }

        let mut due: Vec<Job> = oldest
            .into_values()
            .filter(|j| j.not_before <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.related_id.cmp(&b.related_id));
        due.truncate(limit);
        Ok(due)
    }

    async fn jobs_for(&self, related_id: &str) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let jobs = state
            .jobs
            .values()
            .filter(|j| j.related_id == related_id)
            .cloned()
            .collect();
        Ok(State::sorted(jobs))
    }

    async fn reactivate_failed(&self, job_type: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut reactivated = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Failed && job.job_type == job_type {
                job.status = JobStatus::Active;
                job.try_count = 0;
                reactivated += 1;
            }
        }
        Ok(reactivated)
    }
}

#[async_trait]
impl ServiceStore for InMemoryJobStore {
    async fn lock_service_status(
        &self,
        tx: &mut MemoryTx,
        entity_id: &str,
    ) -> Result<Option<ServiceStatus>, StoreError> {
        Ok(tx.state.services.get(entity_id).copied())
    }

    async fn set_service_status(
        &self,
        tx: &mut MemoryTx,
        entity_id: &str,
        status: ServiceStatus,
    ) -> Result<(), StoreError> {
        tx.state.services.insert(entity_id.to_string(), status);
        Ok(())
    }
}

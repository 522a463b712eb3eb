//! Transition guard: validates a service status change and enqueues the job
//! that carries it out, atomically.

use tracing::{debug, info};

use steward_core::job::{related, types};
use steward_core::{Job, JobId, ServiceStatus};

use crate::jobs::{Queue, QueueError, ServiceStore, StoreError};

/// Statuses from which a service may be (re)activated.
pub const ACTIVATE_FROM: &[ServiceStatus] = &[ServiceStatus::Pending, ServiceStatus::Suspended];
/// Statuses from which a service may be suspended.
pub const SUSPEND_FROM: &[ServiceStatus] = &[ServiceStatus::Active];
/// Statuses from which a service may be terminated.
pub const TERMINATE_FROM: &[ServiceStatus] = &[
    ServiceStatus::Pending,
    ServiceStatus::Active,
    ServiceStatus::Suspended,
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransitionError {
    #[error("bad service status: {0}")]
    BadServiceStatus(ServiceStatus),
    #[error("active jobs exist")]
    ActiveJobsExist,
    #[error("same job exists: {0}")]
    SameJobExists(String),
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TransitionGuard<S: ServiceStore> {
    queue: Queue<S>,
}

impl<S: ServiceStore + 'static> TransitionGuard<S> {
    pub fn new(queue: Queue<S>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Queue<S> {
        &self.queue
    }

    /// Enqueue `job_type` for `entity_id` if the entity may move on.
    ///
    /// Inside one transaction: locks the entity, checks its status against
    /// `allowed`, rejects on conflicting active jobs (any job when
    /// `conflicting` is `None`, otherwise only jobs of that type), optionally
    /// cancels the entity's active jobs, then enqueues. Nothing is written
    /// unless every step succeeds.
    pub async fn alter_status(
        &self,
        entity_id: &str,
        actor: &str,
        job_type: &str,
        conflicting: Option<&str>,
        allowed: &[ServiceStatus],
        cancel_existing: bool,
    ) -> Result<JobId, TransitionError> {
        let store = self.queue.store();
        let mut tx = store.begin().await?;

        let status = store
            .lock_service_status(&mut tx, entity_id)
            .await?
            .ok_or_else(|| TransitionError::EntityNotFound(entity_id.to_string()))?;
        if !allowed.contains(&status) {
            debug!(entity_id, %status, job_type, "transition rejected");
            return Err(TransitionError::BadServiceStatus(status));
        }

        let active = store.active_jobs(&mut tx, entity_id, conflicting).await?;
        if !active.is_empty() {
            return Err(match conflicting {
                Some(job_type) => TransitionError::SameJobExists(job_type.to_string()),
                None => TransitionError::ActiveJobsExist,
            });
        }

        if cancel_existing {
            let canceled = store.cancel_active_jobs(&mut tx, entity_id).await?;
            if canceled > 0 {
                info!(entity_id, canceled, "active jobs canceled");
            }
        }

        let job = Job::new(job_type, related::CHANNEL, entity_id, actor);
        let id = self.queue.add_in_tx(&mut tx, job).await?;
        store.commit(tx).await?;

        info!(entity_id, job_id = %id, job_type, %status, "service transition scheduled");
        Ok(id)
    }

    /// Schedule (re)activation from `Pending` or `Suspended`.
    pub async fn activate(
        &self,
        entity_id: &str,
        actor: &str,
        agent: bool,
    ) -> Result<JobId, TransitionError> {
        let job_type = if agent {
            types::AGENT_PRE_SERVICE_UNSUSPEND
        } else {
            types::CLIENT_PRE_SERVICE_UNSUSPEND
        };
        self.alter_status(entity_id, actor, job_type, None, ACTIVATE_FROM, false)
            .await
    }

    /// Schedule suspension of an `Active` service.
    pub async fn suspend(
        &self,
        entity_id: &str,
        actor: &str,
        agent: bool,
    ) -> Result<JobId, TransitionError> {
        let job_type = if agent {
            types::AGENT_PRE_SERVICE_SUSPEND
        } else {
            types::CLIENT_PRE_SERVICE_SUSPEND
        };
        self.alter_status(entity_id, actor, job_type, None, SUSPEND_FROM, false)
            .await
    }

    /// Schedule termination, canceling whatever else is in flight.
    pub async fn terminate(
        &self,
        entity_id: &str,
        actor: &str,
        agent: bool,
    ) -> Result<JobId, TransitionError> {
        let job_type = if agent {
            types::AGENT_PRE_SERVICE_TERMINATE
        } else {
            types::CLIENT_PRE_SERVICE_TERMINATE
        };
        self.alter_status(entity_id, actor, job_type, Some(job_type), TERMINATE_FROM, true)
            .await
    }
}

//! Queue error model.

use steward_core::{DomainError, JobId};

use super::store::StoreError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("already processing")]
    AlreadyProcessing,
    #[error("duplicated job")]
    DuplicatedJob,
    #[error("job handler not found: {0}")]
    HandlerNotFound(String),
    /// Returned by `process` after a regular shutdown.
    #[error("queue closed")]
    QueueClosed,
    #[error("subscription already exists")]
    SubscriptionExists,
    #[error("subscription not found")]
    SubscriptionNotFound,
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("invalid job: {0}")]
    InvalidJob(#[from] DomainError),
    #[error("worker task failed: {0}")]
    Worker(String),
    #[error("internal error: {0}")]
    Internal(#[from] StoreError),
}

impl QueueError {
    /// Errors that stop the whole queue when raised by a worker.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::HandlerNotFound(_)
                | QueueError::JobNotFound(_)
                | QueueError::Worker(_)
                | QueueError::Internal(_)
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, QueueError::QueueClosed)
    }
}

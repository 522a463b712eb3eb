//! Business handlers invoked per job type.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use steward_core::{DomainError, Job};

/// Business failure reported by a handler. The job is retried per its policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<DomainError> for HandlerError {
    fn from(err: DomainError) -> Self {
        Self(err.to_string())
    }
}

/// Handler for one job type.
///
/// Execution is at-least-once: a handler may see the same job again after a
/// crash or a redelivery, so it should be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        (self.0)(job.clone()).await
    }
}

/// Job type to handler map. Immutable once handed to a queue.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(job_type, FnHandler(f))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Reject;

    #[async_trait]
    impl JobHandler for Reject {
        async fn handle(&self, job: &Job) -> Result<(), HandlerError> {
            Err(HandlerError::new(format!("rejected {}", job.job_type)))
        }
    }

    #[tokio::test]
    async fn dispatches_by_exact_type() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("reject", Reject)
            .register_fn("accept", |_job| async { Ok(()) });

        let job = Job::new("reject", "channel", "e1", "user");
        let err = registry.get("reject").unwrap().handle(&job).await.unwrap_err();
        assert_eq!(err.message(), "rejected reject");

        let job = Job::new("accept", "channel", "e1", "user");
        assert!(registry.get("accept").unwrap().handle(&job).await.is_ok());

        assert!(registry.get("other").is_none());
        assert_eq!(registry.len(), 2);
    }
}

//! Worker: executes the jobs routed to it, one at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use steward_core::{Job, JobId, JobStatus};

use super::error::QueueError;
use super::handler::{HandlerError, JobHandler};
use super::queue::Shared;
use super::store::JobStore;

pub(crate) struct Worker<S: JobStore> {
    index: usize,
    shared: Arc<Shared<S>>,
    exit: Arc<watch::Sender<bool>>,
}

impl<S: JobStore + 'static> Worker<S> {
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared<S>>,
        exit: Arc<watch::Sender<bool>>,
    ) -> Self {
        Self {
            index,
            shared,
            exit,
        }
    }

    /// Process deliveries until the channel closes or a fatal error occurs.
    pub(crate) async fn run(self, mut jobs: mpsc::Receiver<JobId>) -> Result<(), QueueError> {
        debug!(worker = self.index, "worker started");
        while let Some(id) = jobs.recv().await {
            if let Err(err) = self.execute(id).await {
                error!(worker = self.index, job_id = %id, error = %err, "worker stopped on fatal error");
                self.exit.send_replace(true);
                return Err(err);
            }
        }
        debug!(worker = self.index, "worker stopped");
        Ok(())
    }

    async fn execute(&self, id: JobId) -> Result<(), QueueError> {
        let shared = &self.shared;

        // Collected as active, but possibly delivered late or twice.
        let Some(mut job) = shared.store.find_job(id).await? else {
            return Err(QueueError::JobNotFound(id));
        };
        if !job.is_due(shared.clock.now()) {
            debug!(worker = self.index, job_id = %id, status = %job.status, "job no longer due, skipped");
            return Ok(());
        }

        let Some(handler) = shared.handlers.get(&job.job_type) else {
            error!(job_id = %id, job_type = %job.job_type, "job handler not found");
            return Err(QueueError::HandlerNotFound(job.job_type.clone()));
        };

        info!(
            worker = self.index,
            job_id = %id,
            job_type = %job.job_type,
            related_id = %job.related_id,
            try_count = job.try_count,
            "processing job"
        );
        let result = run_handler(handler, &job).await;
        self.apply_result(&mut job, &result);

        // A job canceled while its handler ran must not be retried.
        let mut tx = shared.store.begin().await?;
        match shared.store.find_job_for_update(&mut tx, id).await? {
            Some(current) if current.status == JobStatus::Canceled => {
                job.mark_canceled();
                info!(job_id = %id, job_type = %job.job_type, "job canceled during execution");
            }
            Some(_) => {}
            None => return Err(QueueError::JobNotFound(id)),
        }
        shared.store.save_job(&mut tx, &job).await?;
        shared.store.commit(tx).await?;

        shared.subscriptions.notify(&job, &result);
        Ok(())
    }

    fn apply_result(&self, job: &mut Job, result: &Result<(), HandlerError>) {
        match result {
            Ok(()) => {
                job.mark_done();
                info!(job_id = %job.id, job_type = %job.job_type, "job done");
            }
            Err(err) => {
                let policy = self.shared.config.policy_for(&job.job_type);
                if job.record_failure(policy, self.shared.clock.now()) {
                    error!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        try_count = job.try_count,
                        error = %err,
                        "job failed"
                    );
                } else {
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        try_count = job.try_count,
                        not_before = %job.not_before,
                        error = %err,
                        "job retry scheduled"
                    );
                }
            }
        }
    }
}

/// Run a handler on its own task so that a panic is reported as a failure.
async fn run_handler(handler: Arc<dyn JobHandler>, job: &Job) -> Result<(), HandlerError> {
    let job = job.clone();
    let job_id = job.id;
    match tokio::spawn(async move { handler.handle(&job).await }).await {
        Ok(result) => result,
        Err(err) if err.is_panic() => {
            error!(job_id = %job_id, "job handler panicked");
            Err(HandlerError::new("job handler panicked"))
        }
        Err(err) => Err(HandlerError::new(format!("job handler aborted: {err}"))),
    }
}

//! Queue façade: enqueue, process, close, subscriptions.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use steward_core::{Clock, Job, JobId, JobStatus, SystemClock};

use super::collector::Collector;
use super::config::QueueConfig;
use super::error::QueueError;
use super::handler::HandlerRegistry;
use super::store::JobStore;
use super::subscription::{Callback, Subscriptions};
use super::worker::Worker;

/// Shutdown signalling for one `process` run.
struct RunState {
    exit: Arc<watch::Sender<bool>>,
    exited: watch::Receiver<bool>,
}

/// Owns one `process` run. Dropping it, on return or because the `process`
/// future was dropped, aborts unjoined workers and makes the queue idle again.
struct RunGuard<S: JobStore> {
    shared: Arc<Shared<S>>,
    exit: Arc<watch::Sender<bool>>,
    exited: watch::Sender<bool>,
    workers: Vec<JoinHandle<Result<(), QueueError>>>,
}

impl<S: JobStore> Drop for RunGuard<S> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!("job queue processing dropped, aborting workers");
            for handle in &self.workers {
                handle.abort();
            }
        }
        self.exit.send_replace(true);
        *self.shared.run.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.exited.send_replace(true);
    }
}

pub(crate) struct Shared<S: JobStore> {
    pub(crate) config: QueueConfig,
    pub(crate) store: Arc<S>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) subscriptions: Subscriptions,
    pub(crate) clock: Arc<dyn Clock>,
    run: Mutex<Option<RunState>>,
}

/// Durable job queue.
///
/// Cheap to clone; clones share the same store, handlers and subscriptions.
pub struct Queue<S: JobStore> {
    shared: Arc<Shared<S>>,
}

impl<S: JobStore> Clone for Queue<S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<S: JobStore + 'static> Queue<S> {
    pub fn new(config: QueueConfig, store: Arc<S>, handlers: HandlerRegistry) -> Self {
        Self::with_clock(config, store, handlers, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: QueueConfig,
        store: Arc<S>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store,
                handlers,
                subscriptions: Subscriptions::new(),
                clock,
                run: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn is_processing(&self) -> bool {
        self.shared
            .run
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Enqueue a job in its own transaction.
    pub async fn add(&self, job: Job) -> Result<JobId, QueueError> {
        let store = &self.shared.store;
        let mut tx = store.begin().await?;
        let id = self.add_in_tx(&mut tx, job).await?;
        store.commit(tx).await?;
        Ok(id)
    }

    /// Enqueue a job inside a caller-owned transaction.
    ///
    /// Assigns a fresh id, `Active` status and `created_at`. Unless the type
    /// allows duplicates, fails with `DuplicatedJob` when the entity already
    /// has an active job of the same type; a job carrying an external
    /// transaction id not seen among those active jobs is let through.
    pub async fn add_in_tx(&self, tx: &mut S::Tx, mut job: Job) -> Result<JobId, QueueError> {
        let policy = self.shared.config.policy_for(&job.job_type);

        if !policy.duplicated {
            self.shared
                .store
                .lock_job_slot(tx, &job.related_id, &job.job_type)
                .await?;
            let existing = self
                .shared
                .store
                .active_jobs(tx, &job.related_id, Some(&job.job_type))
                .await?;
            if is_duplicate(&job, &existing) {
                debug!(
                    job_type = %job.job_type,
                    related_id = %job.related_id,
                    "duplicated job rejected"
                );
                return Err(QueueError::DuplicatedJob);
            }
        }

        let now = self.shared.clock.now();
        job.id = JobId::new();
        job.status = JobStatus::Active;
        job.created_at = now;
        if policy.first_start_delay_ms > 0 {
            job.not_before = now
                + chrono::Duration::from_std(policy.first_start_delay()).unwrap_or_default();
        }

        self.shared.store.insert_job(tx, &job).await?;
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            related_id = %job.related_id,
            created_by = %job.created_by,
            not_before = %job.not_before,
            "job added"
        );
        Ok(job.id)
    }

    /// Build a job from its parts, serialize `data` into it and enqueue it
    /// to run no earlier than `delay` from now.
    pub async fn add_with_data_and_delay<T: Serialize>(
        &self,
        job_type: &str,
        related_type: &str,
        related_id: &str,
        creator: &str,
        data: &T,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        let not_before =
            self.shared.clock.now() + chrono::Duration::from_std(delay).unwrap_or_default();
        let job = Job::new(job_type, related_type, related_id, creator)
            .with_payload(data)?
            .scheduled_at(not_before);
        self.add(job).await
    }

    pub async fn add_with_data<T: Serialize>(
        &self,
        job_type: &str,
        related_type: &str,
        related_id: &str,
        creator: &str,
        data: &T,
    ) -> Result<JobId, QueueError> {
        self.add_with_data_and_delay(job_type, related_type, related_id, creator, data, Duration::ZERO)
            .await
    }

    pub async fn add_simple(
        &self,
        job_type: &str,
        related_type: &str,
        related_id: &str,
        creator: &str,
    ) -> Result<JobId, QueueError> {
        self.add_with_data(job_type, related_type, related_id, creator, &serde_json::json!({}))
            .await
    }

    pub async fn add_with_delay(
        &self,
        job_type: &str,
        related_type: &str,
        related_id: &str,
        creator: &str,
        delay: Duration,
    ) -> Result<JobId, QueueError> {
        self.add_with_data_and_delay(
            job_type,
            related_type,
            related_id,
            creator,
            &serde_json::json!({}),
            delay,
        )
        .await
    }

    /// Run the collector and the worker pool until `close` or a fatal error.
    ///
    /// Always returns an error: `QueueClosed` after a regular shutdown, the
    /// first fatal worker error, or the collector's storage error.
    pub async fn process(&self) -> Result<(), QueueError> {
        let (mut guard, exit_rx) = {
            let mut run = self.shared.run.lock().unwrap_or_else(|p| p.into_inner());
            if run.is_some() {
                return Err(QueueError::AlreadyProcessing);
            }
            let (exit, exit_rx) = watch::channel(false);
            let exit = Arc::new(exit);
            let (exited, exited_rx) = watch::channel(false);
            *run = Some(RunState {
                exit: exit.clone(),
                exited: exited_rx,
            });
            let guard = RunGuard {
                shared: self.shared.clone(),
                exit,
                exited,
                workers: Vec::new(),
            };
            (guard, exit_rx)
        };

        let count = self.shared.config.worker_count();
        let capacity = self.shared.config.channel_capacity();
        info!(workers = count, "job queue started");

        let mut senders = Vec::with_capacity(count);
        guard.workers.reserve(count);
        for index in 0..count {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            let worker = Worker::new(index, self.shared.clone(), guard.exit.clone());
            guard.workers.push(tokio::spawn(worker.run(rx)));
        }

        let collected = Collector::new(self.shared.clone(), senders, exit_rx)
            .run()
            .await;

        // Closing the channels lets each worker drain its buffer and return.
        let mut worker_error = None;
        for (index, handle) in guard.workers.iter_mut().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!(worker = index, error = %err, "worker task aborted");
                    Err(QueueError::Worker(err.to_string()))
                }
            };
            if let Err(err) = result {
                worker_error.get_or_insert(err);
            }
        }
        guard.workers.clear();
        drop(guard);

        let err = worker_error.unwrap_or(collected);
        if err.is_closed() {
            info!("job queue stopped");
        } else {
            error!(error = %err, "job queue stopped on error");
        }
        Err(err)
    }

    /// Stop a running `process` and wait until it has returned.
    ///
    /// In-flight handlers finish first. Does nothing when the queue is idle.
    pub async fn close(&self) {
        let (exit, mut exited) = {
            let run = self.shared.run.lock().unwrap_or_else(|p| p.into_inner());
            match run.as_ref() {
                Some(state) => (state.exit.clone(), state.exited.clone()),
                None => return,
            }
        };
        exit.send_replace(true);
        // An error means `process` dropped its sender, i.e. it is gone.
        let _ = exited.wait_for(|done| *done).await;
    }

    /// See [`Subscriptions::subscribe`].
    pub fn subscribe<I, T>(
        &self,
        related_ids: I,
        subscriber_id: &str,
        callback: Callback,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.shared
            .subscriptions
            .subscribe(related_ids, subscriber_id, callback)
    }

    /// See [`Subscriptions::unsubscribe`].
    pub fn unsubscribe<I, T>(&self, related_ids: I, subscriber_id: &str) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.shared
            .subscriptions
            .unsubscribe(related_ids, subscriber_id)
    }
}

fn is_duplicate(job: &Job, active: &[Job]) -> bool {
    if active.is_empty() {
        return false;
    }
    match job.external_tx_id() {
        Some(hash) => active.iter().any(|j| j.external_tx_id() == Some(hash)),
        None => true,
    }
}

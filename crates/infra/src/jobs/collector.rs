//! Collector loop: polls storage and routes due jobs to workers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error};

use steward_core::JobId;

use super::error::QueueError;
use super::queue::Shared;
use super::store::JobStore;

/// Worker responsible for an entity. Stable for the lifetime of the process.
pub(crate) fn worker_index(related_id: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    related_id.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

pub(crate) struct Collector<S: JobStore> {
    shared: Arc<Shared<S>>,
    workers: Vec<mpsc::Sender<JobId>>,
    exit: watch::Receiver<bool>,
}

impl<S: JobStore + 'static> Collector<S> {
    pub(crate) fn new(
        shared: Arc<Shared<S>>,
        workers: Vec<mpsc::Sender<JobId>>,
        exit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            workers,
            exit,
        }
    }

    fn exit_requested(&self) -> bool {
        *self.exit.borrow()
    }

    /// Sweep until told to exit. Returns why it stopped.
    pub(crate) async fn run(mut self) -> QueueError {
        let period = self.shared.config.collect_period();
        let limit = self.shared.config.collect_jobs;

        loop {
            if self.exit_requested() {
                return QueueError::QueueClosed;
            }

            let started = Instant::now();
            let now = self.shared.clock.now();
            let due = match self.shared.store.collect(now, limit).await {
                Ok(due) => due,
                Err(err) => {
                    error!(error = %err, "failed to collect jobs");
                    return err.into();
                }
            };
            if !due.is_empty() {
                debug!(jobs = due.len(), "collected jobs");
            }

            for job in due {
                if self.exit_requested() {
                    return QueueError::QueueClosed;
                }
                let index = worker_index(&job.related_id, self.workers.len());
                tokio::select! {
                    biased;
                    _ = self.exit.changed() => return QueueError::QueueClosed,
                    sent = self.workers[index].send(job.id) => {
                        // A worker only drops its receiver after a fatal error,
                        // which has already raised the exit signal.
                        if sent.is_err() {
                            return QueueError::QueueClosed;
                        }
                    }
                }
            }

            let remaining = period.saturating_sub(started.elapsed());
            tokio::select! {
                biased;
                _ = self.exit.changed() => return QueueError::QueueClosed,
                _ = tokio::time::sleep(remaining) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn routing_is_stable() {
        for workers in 1..16 {
            assert_eq!(worker_index("entity", workers), worker_index("entity", workers));
        }
    }

    proptest! {
        #[test]
        fn routing_stays_in_range(id in ".*", workers in 1usize..64) {
            prop_assert!(worker_index(&id, workers) < workers);
        }
    }
}

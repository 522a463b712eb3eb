//! In-memory completion subscriptions.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use steward_core::Job;

use super::error::QueueError;
use super::handler::HandlerError;

/// Completion callback: the persisted job and the handler outcome.
pub type Callback = Arc<dyn Fn(&Job, &Result<(), HandlerError>) + Send + Sync>;

struct Subscriber {
    id: String,
    callback: Callback,
}

/// Entity id to interested callbacks. Not persisted.
#[derive(Default)]
pub struct Subscriptions {
    entries: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every entity in `related_ids`.
    ///
    /// All or nothing: if `subscriber_id` is already registered for one of
    /// the entities, registrations made by this call are removed again.
    pub fn subscribe<I, S>(
        &self,
        related_ids: I,
        subscriber_id: &str,
        callback: Callback,
    ) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let mut added: Vec<String> = Vec::new();

        for related_id in related_ids {
            let related_id = related_id.into();
            let subs = entries.entry(related_id.clone()).or_default();
            if subs.iter().any(|s| s.id == subscriber_id) {
                for id in &added {
                    remove_subscriber(&mut entries, id, subscriber_id);
                }
                return Err(QueueError::SubscriptionExists);
            }
            subs.push(Subscriber {
                id: subscriber_id.to_string(),
                callback: callback.clone(),
            });
            added.push(related_id);
        }

        Ok(())
    }

    /// Remove `subscriber_id` from every entity in `related_ids`.
    ///
    /// Keeps going over the whole batch; fails with `SubscriptionNotFound`
    /// if at least one entity had no such subscriber.
    pub fn unsubscribe<I, S>(&self, related_ids: I, subscriber_id: &str) -> Result<(), QueueError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        let mut missing = false;
        for related_id in related_ids {
            if !remove_subscriber(&mut entries, related_id.as_ref(), subscriber_id) {
                missing = true;
            }
        }
        if missing {
            return Err(QueueError::SubscriptionNotFound);
        }
        Ok(())
    }

    /// Number of subscribers registered for an entity.
    pub fn count(&self, related_id: &str) -> usize {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        entries.get(related_id).map_or(0, Vec::len)
    }

    /// Fire every callback registered for the job's entity.
    ///
    /// Each callback runs on its own blocking task; a panic is logged and
    /// otherwise ignored. Returns the number of callbacks fired.
    pub fn notify(&self, job: &Job, result: &Result<(), HandlerError>) -> usize {
        let callbacks: Vec<(String, Callback)> = {
            let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
            match entries.get(&job.related_id) {
                Some(subs) => subs
                    .iter()
                    .map(|s| (s.id.clone(), s.callback.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let fired = callbacks.len();
        for (subscriber_id, callback) in callbacks {
            let job_id = job.id;
            let job = job.clone();
            let result = result.clone();
            let task = tokio::task::spawn_blocking(move || callback(&job, &result));
            tokio::spawn(async move {
                if let Err(err) = task.await {
                    warn!(
                        job_id = %job_id,
                        subscriber = %subscriber_id,
                        error = %err,
                        "subscription callback panicked"
                    );
                }
            });
        }
        fired
    }
}

fn remove_subscriber(
    entries: &mut HashMap<String, Vec<Subscriber>>,
    related_id: &str,
    subscriber_id: &str,
) -> bool {
    let Some(subs) = entries.get_mut(related_id) else {
        return false;
    };
    let before = subs.len();
    subs.retain(|s| s.id != subscriber_id);
    let removed = subs.len() != before;
    if subs.is_empty() {
        entries.remove(related_id);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn noop() -> Callback {
        Arc::new(|_job: &Job, _result: &Result<(), HandlerError>| {})
    }

    #[test]
    fn subscribe_is_all_or_nothing() {
        let subs = Subscriptions::new();
        subs.subscribe(["b"], "s1", noop()).unwrap();

        let err = subs.subscribe(["a", "b", "c"], "s1", noop()).unwrap_err();
        assert!(matches!(err, QueueError::SubscriptionExists));
        assert_eq!(subs.count("a"), 0);
        assert_eq!(subs.count("b"), 1);
        assert_eq!(subs.count("c"), 0);
    }

    #[test]
    fn duplicate_id_within_one_batch_rolls_back() {
        let subs = Subscriptions::new();
        let err = subs.subscribe(["a", "a"], "s1", noop()).unwrap_err();
        assert!(matches!(err, QueueError::SubscriptionExists));
        assert_eq!(subs.count("a"), 0);
    }

    #[test]
    fn unsubscribe_is_best_effort() {
        let subs = Subscriptions::new();
        subs.subscribe(["a", "b"], "s1", noop()).unwrap();
        subs.subscribe(["a"], "s2", noop()).unwrap();

        let err = subs.unsubscribe(["a", "x"], "s1").unwrap_err();
        assert!(matches!(err, QueueError::SubscriptionNotFound));
        assert_eq!(subs.count("a"), 1);

        subs.unsubscribe(["b"], "s1").unwrap();
        assert_eq!(subs.count("b"), 0);
    }

    #[tokio::test]
    async fn notify_reaches_only_matching_entity() {
        let subs = Subscriptions::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        subs.subscribe(
            ["e1"],
            "s1",
            Arc::new(move |job: &Job, result: &Result<(), HandlerError>| {
                assert_eq!(job.related_id, "e1");
                assert!(result.is_ok());
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let other = Job::new("t", "channel", "e2", "user");
        assert_eq!(subs.notify(&other, &Ok(())), 0);

        let job = Job::new("t", "channel", "e1", "user");
        assert_eq!(subs.notify(&job, &Ok(())), 1);

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_callback_does_not_affect_others() {
        let subs = Subscriptions::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        subs.subscribe(
            ["e1"],
            "boom",
            Arc::new(|_job: &Job, _result: &Result<(), HandlerError>| panic!("boom")),
        )
        .unwrap();
        subs.subscribe(
            ["e1"],
            "count",
            Arc::new(move |_job: &Job, _result: &Result<(), HandlerError>| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        let job = Job::new("t", "channel", "e1", "user");
        assert_eq!(subs.notify(&job, &Err(HandlerError::new("nope"))), 2);

        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

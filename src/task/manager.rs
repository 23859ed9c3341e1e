//! Process-wide job registry
//!
//! [`TaskManager`] maps job ids to active task trees. It is an explicit,
//! dependency-injected object owned by the server (constructed at startup,
//! torn down at shutdown), not module-level state. Finished tasks stay
//! pollable for a grace period and are then evicted, so very late status
//! polls get a not-found rather than a stale result.

use crate::error::{AdmissionError, Result};
use crate::task::{Task, TaskEvent};
use crate::types::JobId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Registry of live bulk jobs with delayed eviction of finished ones
pub struct TaskManager {
    tasks: Mutex<HashMap<JobId, Arc<dyn Task>>>,
    grace_period: Duration,
}

impl TaskManager {
    /// Create a registry whose finished jobs linger for `grace_period`
    pub fn new(grace_period: Duration) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            grace_period,
        }
    }

    /// Register a task and schedule its eviction after it ends.
    ///
    /// A duplicate job id is a programmer error, not a recoverable
    /// condition, and fails the call outright.
    pub fn add(self: &Arc<Self>, task: Arc<dyn Task>) -> Result<()> {
        let id = task.state().id().clone();
        // Subscribe before publishing the entry so the terminal event
        // cannot slip between the insert and the watch.
        let mut events = task.state().subscribe();
        let already_ended = task.state().is_ended();

        {
            let mut tasks = self.lock();
            if tasks.contains_key(&id) {
                return Err(AdmissionError::DuplicateJob { id: id.to_string() }.into());
            }
            tasks.insert(id.clone(), task);
        }
        tracing::info!(job_id = %id, "job registered");

        let manager = Arc::downgrade(self);
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            if !already_ended {
                loop {
                    match events.recv().await {
                        Ok(TaskEvent::Ended(_)) | Err(RecvError::Closed) => break,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => continue,
                    }
                }
            }
            tokio::time::sleep(grace_period).await;
            if let Some(manager) = manager.upgrade()
                && manager.remove(&id)
            {
                tracing::debug!(job_id = %id, "evicted finished job");
            }
        });
        Ok(())
    }

    /// Look up a job by id
    pub fn get(&self, id: &JobId) -> Option<Arc<dyn Task>> {
        self.lock().get(id).cloned()
    }

    /// Whether a job with this id is currently tracked
    pub fn has(&self, id: &JobId) -> bool {
        self.lock().contains_key(id)
    }

    /// Detach a job from the registry, cancelling its in-flight work.
    ///
    /// Idempotent; the return value distinguishes "cancelled" from
    /// "not found" for the cancellation endpoint.
    pub fn remove(&self, id: &JobId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(task) => {
                task.state().cancel();
                true
            }
            None => false,
        }
    }

    /// Number of tracked jobs
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Aggregate remaining time across every tracked job, in seconds.
    ///
    /// Returns 0 when every job is complete, -1 when any running job's
    /// estimate is unknown, else the ceiling of the summed estimates. This
    /// is the admission-control gate: a kick-off is only accepted while
    /// this returns 0.
    pub fn get_remaining_time(&self) -> f64 {
        let snapshots: Vec<_> = self.lock().values().map(|task| task.snapshot()).collect();

        let mut sum = 0.0;
        let mut all_complete = true;
        for snapshot in snapshots {
            if snapshot.is_ended() {
                continue;
            }
            all_complete = false;
            if snapshot.remaining_time < 0.0 {
                return -1.0;
            }
            sum += snapshot.remaining_time;
        }
        if all_complete { 0.0 } else { sum.ceil() }
    }

    /// Force-terminate every tracked job (deterministic test teardown and
    /// server shutdown)
    pub fn end_all(&self) {
        let tasks: Vec<_> = self.lock().values().cloned().collect();
        for task in tasks {
            task.state().cancel();
            task.state().end(None);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Arc<dyn Task>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;
    use async_trait::async_trait;
    use tokio_test::assert_ok;

    /// Minimal task whose lifecycle the tests drive by hand
    struct ManualTask {
        state: TaskState,
    }

    impl ManualTask {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                state: TaskState::new(),
            })
        }

        fn with_id(id: &str) -> Arc<Self> {
            Arc::new(Self {
                state: TaskState::with_id(JobId::from(id)),
            })
        }
    }

    #[async_trait]
    impl Task for ManualTask {
        fn state(&self) -> &TaskState {
            &self.state
        }

        async fn start(&self) -> Result<()> {
            self.state.end(None);
            Ok(())
        }
    }

    fn manager(grace: Duration) -> Arc<TaskManager> {
        Arc::new(TaskManager::new(grace))
    }

    #[tokio::test]
    async fn add_then_lookup_round_trips() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::with_id("job-1");
        assert_ok!(manager.add(task));

        assert!(manager.has(&JobId::from("job-1")));
        assert!(manager.get(&JobId::from("job-1")).is_some());
        assert!(!manager.has(&JobId::from("job-2")));
        assert!(manager.get(&JobId::from("job-2")).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_fails_the_second_add() {
        let manager = manager(Duration::from_secs(60));
        manager.add(ManualTask::with_id("job-1")).unwrap();

        let err = manager.add(ManualTask::with_id("job-1")).unwrap_err();
        assert!(
            matches!(
                err,
                crate::error::Error::Admission(AdmissionError::DuplicateJob { .. })
            ),
            "got: {err}"
        );
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn remove_distinguishes_cancelled_from_not_found() {
        let manager = manager(Duration::from_secs(60));
        manager.add(ManualTask::with_id("job-1")).unwrap();

        assert!(manager.remove(&JobId::from("job-1")));
        assert!(!manager.remove(&JobId::from("job-1")));
        assert!(!manager.remove(&JobId::from("never-existed")));
    }

    #[tokio::test]
    async fn remove_propagates_cancellation_to_the_task() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::with_id("job-1");
        let token = task.state().cancellation_token();
        manager.add(task).unwrap();

        manager.remove(&JobId::from("job-1"));
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_job_is_evicted_after_the_grace_period() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::new();
        let id = task.state().id().clone();
        manager.add(Arc::clone(&task) as Arc<dyn Task>).unwrap();

        task.state().end(None);
        // still pollable within the grace period
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(manager.has(&id));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!manager.has(&id));
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn task_already_ended_at_add_time_is_still_evicted() {
        let manager = manager(Duration::from_secs(10));
        let task = ManualTask::new();
        let id = task.state().id().clone();
        task.state().end(None);

        manager.add(task).unwrap();
        assert!(manager.has(&id));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(!manager.has(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn running_job_is_not_evicted() {
        let manager = manager(Duration::from_secs(10));
        let task = ManualTask::with_id("job-1");
        manager.add(task).unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(manager.has(&JobId::from("job-1")));
    }

    #[tokio::test]
    async fn remaining_time_is_zero_for_empty_registry() {
        let manager = manager(Duration::from_secs(60));
        assert_eq!(manager.get_remaining_time(), 0.0);
    }

    #[tokio::test]
    async fn remaining_time_is_zero_when_every_job_is_complete() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::with_id("job-1");
        manager.add(Arc::clone(&task) as Arc<dyn Task>).unwrap();
        task.state().end(None);

        assert_eq!(manager.get_remaining_time(), 0.0);
    }

    #[tokio::test]
    async fn remaining_time_is_unknown_while_a_job_cannot_estimate() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::with_id("job-1");
        manager.add(Arc::clone(&task) as Arc<dyn Task>).unwrap();
        // started but below the estimation threshold
        task.state().set_total(1000);
        task.state().set_position(1);

        assert_eq!(manager.get_remaining_time(), -1.0);
    }

    #[tokio::test]
    async fn remaining_time_sums_and_rounds_up_estimates() {
        let manager = manager(Duration::from_secs(60));
        let task = ManualTask::with_id("job-1");
        manager.add(Arc::clone(&task) as Arc<dyn Task>).unwrap();

        task.state().set_total(100);
        task.state().mark_started();
        std::thread::sleep(Duration::from_millis(20));
        task.state().set_position(50);

        let remaining = manager.get_remaining_time();
        assert!(remaining >= 1.0, "ceiling of a positive estimate, got {remaining}");
        assert_eq!(remaining, remaining.ceil());
    }

    #[tokio::test]
    async fn end_all_terminates_every_tracked_job() {
        let manager = manager(Duration::from_secs(60));
        let a = ManualTask::with_id("job-a");
        let b = ManualTask::with_id("job-b");
        manager.add(Arc::clone(&a) as Arc<dyn Task>).unwrap();
        manager.add(Arc::clone(&b) as Arc<dyn Task>).unwrap();

        manager.end_all();

        assert!(a.state().is_ended());
        assert!(b.state().is_ended());
        assert!(a.state().cancellation_token().is_cancelled());
        assert_eq!(manager.get_remaining_time(), 0.0);
    }
}

//! Asynchronous task lifecycle engine
//!
//! Every long-running bulk operation is a task: an identified unit of work
//! with progress tracking, an ETA estimate, lifecycle notifications, and an
//! idempotent terminal state. The concrete tasks are organized by domain:
//! - [`download`] — streaming one remote NDJSON file
//! - [`collection`] — fanning out one download per import input
//! - [`export`] — simulated bulk export preparation
//! - [`manager`] — the process-wide job registry with delayed eviction
//!
//! State lives in [`TaskState`], shared by every task implementation.
//! Listeners receive immutable [`TaskSnapshot`] copies over a broadcast
//! channel, never a live reference.

pub mod collection;
pub mod download;
pub mod export;
pub mod manager;

pub use collection::DownloadTaskCollection;
pub use download::{DownloadOptions, DownloadTask};
pub use export::ExportTask;
pub use manager::TaskManager;

use crate::error::Result;
use crate::types::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

/// Buffered lifecycle events per task before slow subscribers lag
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Progress fraction below which the ETA extrapolation is considered noise
const MIN_PROGRESS_FOR_ETA: f64 = 0.1;

/// Immutable copy of a task's state at one instant
///
/// This is what listeners receive with every notification and what the
/// status API serializes; it never aliases live task state.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TaskSnapshot {
    /// The task's job id
    pub id: JobId,
    /// When the task started, if it has
    pub start_time: Option<DateTime<Utc>>,
    /// When the task ended, if it has
    pub end_time: Option<DateTime<Utc>>,
    /// Units of work done so far
    pub position: u64,
    /// Units of work expected in total (0 = unknown)
    pub total: u64,
    /// Terminal failure description, if the task ended with an error
    pub error: Option<String>,
    /// Progress in [-1, 1]: -1 unknown/not started, 1 complete
    pub progress: f64,
    /// Estimated seconds remaining: -1 unknown, 0 done
    pub remaining_time: f64,
}

impl TaskSnapshot {
    /// Whether the task has reached a terminal state
    pub fn is_ended(&self) -> bool {
        self.end_time.is_some()
    }

    /// Progress as a percentage in [0, 100], clamping the unknown state to 0
    pub fn percent(&self) -> f64 {
        if self.progress < 0.0 {
            0.0
        } else {
            self.progress * 100.0
        }
    }
}

/// Lifecycle notification carrying a state snapshot
///
/// `Started` fires once, on the first forward movement of `position`;
/// `Progress` fires on every change; `Ended` fires exactly once.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task made its first forward progress
    Started(TaskSnapshot),
    /// The task's position changed
    Progress(TaskSnapshot),
    /// The task reached a terminal state
    Ended(TaskSnapshot),
}

/// Mutable fields guarded by the state mutex
#[derive(Debug, Default)]
struct Inner {
    start_wall: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    end_wall: Option<DateTime<Utc>>,
    position: u64,
    total: u64,
    error: Option<String>,
    started_emitted: bool,
}

/// Shared lifecycle state for one task
///
/// All mutation goes through the setters here, which enforce the lifecycle
/// invariants: the start time is set at most once, the end is idempotent
/// (first call wins), position changes are no-ops when the value is
/// unchanged, and reaching `total` ends the task automatically.
#[derive(Debug)]
pub struct TaskState {
    id: JobId,
    inner: Mutex<Inner>,
    events: broadcast::Sender<TaskEvent>,
    cancel: CancellationToken,
}

impl TaskState {
    /// Create state for a new task, generating a fresh job id
    pub fn new() -> Self {
        Self::with_id(JobId::random())
    }

    /// Create state with an explicit job id
    pub fn with_id(id: JobId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            inner: Mutex::new(Inner::default()),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// The task's immutable job id
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Subscribe to this task's lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Request cooperative cancellation of the task's in-flight work
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Clone of the task's cancellation token
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Completes when cancellation has been requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record the start time if not already set.
    ///
    /// The start time is idempotent-set: a second call leaves the original
    /// value and logs a warning, since a task must not be started twice.
    pub fn mark_started(&self) {
        let mut inner = self.lock();
        if inner.start_wall.is_some() {
            tracing::warn!(job_id = %self.id, "start time already set, keeping original");
            return;
        }
        inner.start_wall = Some(Utc::now());
        inner.started_at = Some(Instant::now());
    }

    /// Units of work done so far
    pub fn position(&self) -> u64 {
        self.lock().position
    }

    /// Units of work expected in total (0 = unknown)
    pub fn total(&self) -> u64 {
        self.lock().total
    }

    /// Terminal failure description, if any
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Whether the task has reached a terminal state
    pub fn is_ended(&self) -> bool {
        self.lock().end_wall.is_some()
    }

    /// Seconds since the task started (0 if it has not)
    pub fn up_time(&self) -> f64 {
        self.lock()
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Set the expected total units of work
    pub fn set_total(&self, total: u64) {
        self.lock().total = total;
    }

    /// Move the position forward.
    ///
    /// No-ops when the value is unchanged. The first movement away from 0
    /// emits `Started`; every change emits `Progress`; reaching `total`
    /// (when known) ends the task successfully.
    pub fn set_position(&self, position: u64) {
        let (first_move, auto_end, snapshot) = {
            let mut inner = self.lock();
            if inner.position == position || inner.end_wall.is_some() {
                return;
            }
            if position < inner.position {
                tracing::warn!(
                    job_id = %self.id,
                    from = inner.position,
                    to = position,
                    "position moved backwards"
                );
            }
            let first_move = !inner.started_emitted && position > 0;
            if first_move {
                inner.started_emitted = true;
                if inner.start_wall.is_none() {
                    inner.start_wall = Some(Utc::now());
                    inner.started_at = Some(Instant::now());
                }
            }
            inner.position = position;
            let auto_end = inner.total > 0 && position >= inner.total;
            (first_move, auto_end, self.snapshot_locked(&inner, None))
        };

        if first_move {
            self.events.send(TaskEvent::Started(snapshot.clone())).ok();
        }
        self.events.send(TaskEvent::Progress(snapshot)).ok();
        if auto_end {
            self.end(None);
        }
    }

    /// Advance the position by a delta
    pub fn add_position(&self, delta: u64) {
        let next = self.lock().position.saturating_add(delta);
        self.set_position(next);
    }

    /// End the task, optionally with a terminal error.
    ///
    /// Idempotent: the first call wins and emits the single `Ended`
    /// notification; later calls change nothing.
    pub fn end(&self, error: Option<String>) {
        let snapshot = {
            let mut inner = self.lock();
            if inner.end_wall.is_some() {
                return;
            }
            inner.end_wall = Some(Utc::now());
            inner.error = error;
            self.snapshot_locked(&inner, None)
        };

        if let Some(err) = &snapshot.error {
            tracing::warn!(job_id = %self.id, error = %err, "task ended with error");
        } else {
            tracing::debug!(job_id = %self.id, "task ended");
        }
        self.events.send(TaskEvent::Ended(snapshot)).ok();
    }

    /// Current progress in [-1, 1]
    pub fn progress(&self) -> f64 {
        self.snapshot().progress
    }

    /// Estimated seconds remaining (-1 unknown, 0 done)
    pub fn remaining_time(&self) -> f64 {
        self.snapshot().remaining_time
    }

    /// Immutable copy of the current state
    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock();
        self.snapshot_locked(&inner, None)
    }

    /// Snapshot with position/total substituted by aggregated values.
    ///
    /// Composite tasks redefine position and total as sums over their
    /// children; this recomputes the derived progress and ETA from those
    /// sums while keeping this task's own timestamps and error.
    pub fn snapshot_with(&self, position: u64, total: u64) -> TaskSnapshot {
        let inner = self.lock();
        self.snapshot_locked(&inner, Some((position, total)))
    }

    /// Emit a progress notification carrying an externally built snapshot.
    ///
    /// Used by composite tasks to forward aggregated progress.
    pub(crate) fn emit_progress(&self, snapshot: TaskSnapshot) {
        self.events.send(TaskEvent::Progress(snapshot)).ok();
    }

    fn snapshot_locked(&self, inner: &Inner, substitute: Option<(u64, u64)>) -> TaskSnapshot {
        let (position, total) = substitute.unwrap_or((inner.position, inner.total));
        let ended = inner.end_wall.is_some();
        let started = inner.start_wall.is_some();
        let progress = compute_progress(started, ended, position, total);
        let elapsed = inner
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        TaskSnapshot {
            id: self.id.clone(),
            start_time: inner.start_wall,
            end_time: inner.end_wall,
            position,
            total,
            error: inner.error.clone(),
            progress,
            remaining_time: compute_remaining(ended, progress, elapsed),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress in [-1, 1]: -1 before start or when the total is unknown,
/// 1 once ended (with or without error), else the completed fraction.
fn compute_progress(started: bool, ended: bool, position: u64, total: u64) -> f64 {
    if ended {
        return 1.0;
    }
    if !started || total == 0 {
        return -1.0;
    }
    (position as f64 / total as f64).min(1.0)
}

/// Linear ETA extrapolation from elapsed time and progress fraction.
///
/// Below [`MIN_PROGRESS_FOR_ETA`] measured progress the estimate is too
/// noisy to be useful and is reported as unknown.
fn compute_remaining(ended: bool, progress: f64, elapsed_secs: f64) -> f64 {
    if ended {
        return 0.0;
    }
    if progress < MIN_PROGRESS_FOR_ETA {
        return -1.0;
    }
    elapsed_secs * (1.0 - progress) / progress
}

/// A unit of asynchronous, progress-trackable, cancelable work
///
/// Implementations provide `start` (the actual work) and may override
/// `init` for async pre-flight such as opening a connection. The default
/// `init` is a no-op; `start` has no default, so every concrete task must
/// implement it.
#[async_trait]
pub trait Task: Send + Sync {
    /// The task's shared lifecycle state
    fn state(&self) -> &TaskState;

    /// Optional async preparation before `start`
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Perform the unit of work, driving the state to a terminal end
    async fn start(&self) -> Result<()>;

    /// Immutable copy of the current state.
    ///
    /// Composite tasks override this to aggregate over children.
    fn snapshot(&self) -> TaskSnapshot {
        self.state().snapshot()
    }

    /// The completed-job manifest, for tasks that produce one
    fn manifest(&self) -> Option<serde_json::Value> {
        None
    }
}

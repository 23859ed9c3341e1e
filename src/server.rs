//! Top-level server instance
//!
//! [`BulkDataServer`] owns the shared pieces of the system: the database,
//! the job registry, the configuration, and the event broadcast channel.
//! Kick-off requests go through it so admission control (one bulk job at a
//! time) is enforced in one place.

use crate::config::Config;
use crate::db::Database;
use crate::error::{AdmissionError, Error, Result};
use crate::task::export::ExportParams;
use crate::task::{
    DownloadOptions, DownloadTaskCollection, ExportTask, Task, TaskEvent, TaskManager, TaskState,
};
use crate::types::{Event, ImportRequest, JobId, JobKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;

/// Main server instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct BulkDataServer {
    /// Database instance for persistence (wrapped in Arc for sharing across tasks)
    /// Public for integration tests to seed fixture data
    pub db: Arc<Database>,
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Job registry with delayed eviction
    pub(crate) tasks: Arc<TaskManager>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Flag to indicate whether new jobs are accepted (cleared during shutdown)
    accepting_new: Arc<AtomicBool>,
}

impl BulkDataServer {
    /// Create a new server instance
    ///
    /// Opens/creates the SQLite database, runs migrations, and sets up the
    /// job registry and event broadcast channel.
    pub async fn new(config: Config) -> Result<Self> {
        let db = Database::new(&config.persistence.database_path).await?;

        // Multiple subscribers receive all events independently
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let tasks = Arc::new(TaskManager::new(config.grace_period()));

        Ok(Self {
            db: Arc::new(db),
            config: Arc::new(config),
            tasks,
            event_tx,
            accepting_new: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Subscribe to job lifecycle events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all
    /// events independently; a subscriber that falls behind by more than
    /// 1000 events receives a `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The job registry
    pub fn task_manager(&self) -> Arc<TaskManager> {
        Arc::clone(&self.tasks)
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Enforce the single-job-at-a-time gate.
    ///
    /// A kick-off while any tracked job still has remaining work is
    /// rejected with a retry hint derived from the aggregate estimate, or
    /// a fixed fallback when the estimate is unknown.
    fn check_admission(&self) -> Result<()> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let remaining = self.tasks.get_remaining_time();
        if remaining == 0.0 {
            return Ok(());
        }
        let retry_after = if remaining < 0.0 {
            self.config.import.fallback_retry_after_secs
        } else {
            remaining as u64
        };
        Err(AdmissionError::JobAlreadyRunning { retry_after }.into())
    }

    /// Forward a task's progress notifications onto the server-wide
    /// event channel
    fn spawn_progress_events(&self, state: &TaskState, id: JobId) {
        let mut events = state.subscribe();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TaskEvent::Progress(snapshot)) => {
                        server.emit_event(Event::JobProgress {
                            id: id.clone(),
                            percent: snapshot.percent(),
                        });
                    }
                    Ok(TaskEvent::Ended(_)) | Err(RecvError::Closed) => break,
                    _ => continue,
                }
            }
        });
    }

    /// Transport options for import file downloads, per configuration
    fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            require_https: self.config.import.require_https,
            max_redirects: self.config.import.max_redirects,
            max_line_length: self.config.import.max_line_length,
        }
    }

    /// Accept a bulk import kick-off, registering and launching the job.
    ///
    /// Returns the new job id; progress is polled through the registry.
    pub async fn kick_off_import(
        &self,
        request_url: String,
        request: ImportRequest,
    ) -> Result<JobId> {
        if request.input_format != "application/fhir+ndjson" {
            return Err(Error::UnsupportedFormat(request.input_format));
        }
        if url::Url::parse(&request.input_source).is_err() {
            return Err(Error::InvalidRequest(format!(
                "inputSource must be an absolute URL, got \"{}\"",
                request.input_source
            )));
        }
        if request.input.is_empty() {
            return Err(Error::InvalidRequest(
                "input must name at least one file".to_string(),
            ));
        }
        self.check_admission()?;

        let collection = Arc::new(DownloadTaskCollection::new(
            request_url,
            self.config.api.base_url.clone(),
            request.input,
            self.download_options(),
        ));
        let id = collection.state().id().clone();
        self.tasks.add(Arc::clone(&collection) as Arc<dyn Task>)?;
        self.emit_event(Event::JobQueued {
            id: id.clone(),
            kind: JobKind::Import,
        });
        self.spawn_progress_events(collection.state(), id.clone());
        tracing::info!(job_id = %id, files = collection.inputs().len(), "import job accepted");

        let server = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            // per-file failures are reported through the manifest, not here
            if let Err(e) = collection.start().await {
                tracing::error!(job_id = %job_id, error = %e, "import job failed");
                server.emit_event(Event::JobFailed {
                    id: job_id,
                    error: e.to_string(),
                });
            } else {
                server.emit_event(Event::JobCompleted { id: job_id });
            }
        });

        Ok(id)
    }

    /// Accept a bulk export kick-off, registering and launching the job.
    pub async fn kick_off_export(
        &self,
        request_url: String,
        params: ExportParams,
    ) -> Result<JobId> {
        self.check_admission()?;

        let export = Arc::new(ExportTask::new(
            Arc::clone(&self.db),
            request_url,
            self.config.api.base_url.clone(),
            params,
            self.config.simulated_export_duration(),
        ));
        // counting runs up front so a bad request fails the kick-off, not
        // the background job
        export.init().await?;

        let id = export.state().id().clone();
        self.tasks.add(Arc::clone(&export) as Arc<dyn Task>)?;
        self.emit_event(Event::JobQueued {
            id: id.clone(),
            kind: JobKind::Export,
        });
        self.spawn_progress_events(export.state(), id.clone());
        tracing::info!(job_id = %id, "export job accepted");

        let server = self.clone();
        let job_id = id.clone();
        tokio::spawn(async move {
            if let Err(e) = export.start().await {
                tracing::warn!(job_id = %job_id, error = %e, "export job did not complete");
                server.emit_event(Event::JobFailed {
                    id: job_id,
                    error: e.to_string(),
                });
            } else {
                server.emit_event(Event::JobCompleted { id: job_id });
            }
        });

        Ok(id)
    }

    /// Cancel a tracked job, detaching it and aborting in-flight work.
    ///
    /// Returns whether a job was actually cancelled; a very late poller
    /// cannot distinguish "already completed and evicted" from "never
    /// existed".
    pub fn cancel_job(&self, id: &JobId) -> bool {
        let removed = self.tasks.remove(id);
        if removed {
            self.emit_event(Event::JobRemoved { id: id.clone() });
            tracing::info!(job_id = %id, "job cancelled");
        }
        removed
    }

    /// Graceful shutdown: stop accepting jobs, terminate tracked jobs,
    /// and close the database.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down");
        self.accepting_new.store(false, Ordering::SeqCst);
        self.tasks.end_all();
        self.db.close().await;
        Ok(())
    }

    /// Spawn the REST API server in a background task
    ///
    /// The server runs concurrently with job processing and listens on the
    /// configured bind address.
    pub fn spawn_api_server(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let server = Arc::clone(self);
        let config = server.get_config();

        tokio::spawn(async move { crate::api::start_api_server(server, config).await })
    }
}

/// Shared test helpers for creating server instances in tests.
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use tempfile::TempDir;

    /// Create a test server over a throwaway database, with plain-http
    /// imports allowed and throttling disabled.
    /// Returns the server and the tempdir (which must be kept alive).
    pub(crate) async fn create_test_server() -> (BulkDataServer, TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.persistence.database_path = temp_dir.path().join("test.db");
        config.import.require_https = false;
        config.import.grace_period_secs = 60;
        config.export.row_delay_ms = 0;
        config.export.simulated_duration_secs = 0;
        config.api.rate_limit.enabled = false;

        let server = BulkDataServer::new(config).await.unwrap();
        (server, temp_dir)
    }

    /// Block until the given job reaches a terminal state
    pub(crate) async fn wait_for_job(server: &BulkDataServer, id: &JobId) {
        for _ in 0..500 {
            match server.task_manager().get(id) {
                Some(task) if !task.state().is_ended() => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                _ => return,
            }
        }
        panic!("job {id} did not finish in time");
    }
}

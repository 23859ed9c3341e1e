//! Composite task fanning out one download per import input
//!
//! A [`DownloadTaskCollection`] owns one [`DownloadTask`] per input file
//! descriptor. Initialization is all-settled: a child that fails its
//! pre-flight is ended with its error and excluded from the runnable set
//! while its siblings proceed. Individual file failures never fail the
//! collection; the job is done when every child is terminal, and the
//! manifest partitions children into `output` and `error` entries.

use crate::error::Result;
use crate::task::download::{DownloadOptions, DownloadTask};
use crate::task::{Task, TaskEvent, TaskState};
use crate::types::{ImportInput, JobManifest, ManifestEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

/// Composite task orchestrating the downloads of one bulk import job
pub struct DownloadTaskCollection {
    state: Arc<TaskState>,
    /// The kick-off request URL, echoed in the manifest
    request: String,
    /// Public base URL used to build outcome links
    base_url: String,
    inputs: Vec<ImportInput>,
    options: DownloadOptions,
    children: Arc<Mutex<Vec<Arc<DownloadTask>>>>,
    initialized: AtomicBool,
}

impl DownloadTaskCollection {
    /// Create a collection for one import kick-off request
    pub fn new(
        request: impl Into<String>,
        base_url: impl Into<String>,
        inputs: Vec<ImportInput>,
        options: DownloadOptions,
    ) -> Self {
        Self {
            state: Arc::new(TaskState::new()),
            request: request.into(),
            base_url: base_url.into(),
            inputs,
            options,
            children: Arc::new(Mutex::new(Vec::new())),
            initialized: AtomicBool::new(false),
        }
    }

    /// The input file descriptors this collection was created for
    pub fn inputs(&self) -> &[ImportInput] {
        &self.inputs
    }

    /// Children spawned so far (empty before `init`)
    pub fn children(&self) -> Vec<Arc<DownloadTask>> {
        lock_children(&self.children).clone()
    }

    /// Sum of child positions and totals, recomputed on read
    fn aggregate(children: &Mutex<Vec<Arc<DownloadTask>>>) -> (u64, u64) {
        let children = lock_children(children);
        let position = children.iter().map(|c| c.state().position()).sum();
        let total = children.iter().map(|c| c.state().total()).sum();
        (position, total)
    }

    /// Build an outcome link embedding a human-readable message
    fn outcome_link(&self, severity: &str, code: &str, message: &str) -> String {
        format!(
            "{}/outcome?issueCode={}&severity={}&message={}",
            self.base_url.trim_end_matches('/'),
            code,
            severity,
            urlencoding::encode(message)
        )
    }

    /// The structured bulk import manifest.
    ///
    /// `output` and `error` partition the children by terminal error state;
    /// with every child terminal their lengths always sum to the input
    /// count. `transactionTime` reports the end time, or now while the
    /// collection is still running.
    pub fn import_manifest(&self) -> JobManifest {
        let snapshot = self.state.snapshot();
        let mut output = Vec::new();
        let mut error = Vec::new();

        for child in lock_children(&self.children).iter() {
            let input_url = child.url().to_string();
            let count = child.count();
            match child.state().error() {
                None => output.push(ManifestEntry {
                    kind: "OperationOutcome".to_string(),
                    input_url: Some(input_url),
                    count,
                    url: self.outcome_link(
                        "information",
                        "informational",
                        &format!(
                            "{count} {} resources imported successfully",
                            child.resource_type()
                        ),
                    ),
                }),
                Some(failure) => error.push(ManifestEntry {
                    kind: "OperationOutcome".to_string(),
                    input_url: Some(input_url),
                    count,
                    url: self.outcome_link("error", "processing", &failure),
                }),
            }
        }

        JobManifest {
            transaction_time: snapshot.end_time.unwrap_or_else(Utc::now),
            request: self.request.clone(),
            requires_access_token: false,
            output,
            error,
        }
    }

    /// Propagate collection-level cancellation to every child, so removing
    /// the job aborts its in-flight downloads. The watcher exits once the
    /// collection ends.
    fn spawn_cancel_forwarder(&self) {
        let children = Arc::clone(&self.children);
        let token = self.state.cancellation_token();
        let mut events = self.state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        for child in lock_children(&children).iter() {
                            child.state().cancel();
                        }
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(TaskEvent::Ended(_)) | Err(RecvError::Closed) => break,
                        _ => continue,
                    }
                }
            }
        });
    }

    /// Forward a child's progress as aggregated collection progress
    fn spawn_progress_forwarder(&self, child: &Arc<DownloadTask>) {
        let mut rx = child.state().subscribe();
        let state = Arc::clone(&self.state);
        let children = Arc::clone(&self.children);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TaskEvent::Ended(_)) | Err(RecvError::Closed) => break,
                    Ok(_) => {
                        let (position, total) = Self::aggregate(&children);
                        state.emit_progress(state.snapshot_with(position, total));
                    }
                    Err(RecvError::Lagged(_)) => continue,
                }
            }
        });
    }
}

#[async_trait]
impl Task for DownloadTaskCollection {
    fn state(&self) -> &TaskState {
        &self.state
    }

    /// Spawn one child per input and initialize them concurrently.
    ///
    /// All-settled: every child's pre-flight runs to completion regardless
    /// of sibling failures. A failed child is ended with its error here and
    /// skipped by `start`; the aggregated total covers only children whose
    /// pre-flight succeeded.
    async fn init(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let children: Vec<Arc<DownloadTask>> = self
            .inputs
            .iter()
            .map(|input| {
                Arc::new(DownloadTask::new(
                    input.url.clone(),
                    input.resource_type.clone(),
                    self.options.clone(),
                ))
            })
            .collect();

        let results =
            futures::future::join_all(children.iter().map(|child| child.init())).await;
        for (child, result) in children.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    url = %child.url(),
                    error = %e,
                    "import file failed pre-flight"
                );
                child.state().end(Some(e.to_string()));
            }
        }

        let total = children
            .iter()
            .filter(|c| !c.state().is_ended())
            .map(|c| c.state().total())
            .sum();
        self.state.set_total(total);

        *lock_children(&self.children) = children;
        Ok(())
    }

    /// Drive every runnable child to completion concurrently.
    ///
    /// Children's outputs are discarded; this task's job is orchestration
    /// and metering, not content capture. Ends successfully once every
    /// child is terminal, whatever the per-file outcomes were.
    async fn start(&self) -> Result<()> {
        if !self.initialized.load(Ordering::SeqCst) {
            self.init().await?;
        }
        self.state.mark_started();

        let runnable: Vec<Arc<DownloadTask>> = lock_children(&self.children)
            .iter()
            .filter(|c| !c.state().is_ended())
            .cloned()
            .collect();

        self.spawn_cancel_forwarder();
        if self.state.cancellation_token().is_cancelled() {
            for child in &runnable {
                child.state().cancel();
            }
        }
        for child in &runnable {
            self.spawn_progress_forwarder(child);
        }

        // Per-file failures are recorded on the children themselves.
        let _ = futures::future::join_all(runnable.iter().map(|child| child.start())).await;

        self.state.end(None);
        Ok(())
    }

    fn snapshot(&self) -> crate::task::TaskSnapshot {
        if lock_children(&self.children).is_empty() {
            return self.state.snapshot();
        }
        let (position, total) = Self::aggregate(&self.children);
        self.state.snapshot_with(position, total)
    }

    fn manifest(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.import_manifest()).ok()
    }
}

fn lock_children(
    children: &Mutex<Vec<Arc<DownloadTask>>>,
) -> std::sync::MutexGuard<'_, Vec<Arc<DownloadTask>>> {
    match children.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

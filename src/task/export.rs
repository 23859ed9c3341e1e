//! Simulated bulk export preparation task
//!
//! A real export would materialize NDJSON files; this reference server
//! instead runs an [`ExportTask`] that counts the matching rows up front,
//! advances its progress over a configured duration, and then publishes a
//! manifest whose file links point at the streaming download endpoint with
//! the pagination parameters baked into the URLs.

use crate::db::Database;
use crate::error::{Error, Result};
use crate::task::{Task, TaskState};
use crate::types::{JobManifest, ManifestEntry};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Progress units an export job is divided into
const EXPORT_TOTAL_UNITS: u64 = 100;

/// Sleep slices the simulated preparation is spread over
const EXPORT_STEPS: u64 = 20;

/// Parameters of one bulk export kick-off
#[derive(Debug, Clone)]
pub struct ExportParams {
    /// Resource types to export (empty = every ingested type)
    pub resource_types: Vec<String>,
    /// Restrict rows to one patient group
    pub group_id: Option<String>,
    /// Row limit baked into the generated download links
    pub page_limit: u64,
    /// Dataset multiplier baked into the generated download links
    pub multiplier: u64,
}

/// Task that simulates preparing a bulk export
pub struct ExportTask {
    state: TaskState,
    db: Arc<Database>,
    /// The kick-off request URL, echoed in the manifest
    request: String,
    /// Public base URL used to build download links
    base_url: String,
    params: ExportParams,
    /// Simulated preparation time
    duration: Duration,
    /// Per-type row counts captured during init
    counts: Mutex<Vec<(String, u64)>>,
}

impl ExportTask {
    /// Create an export task for one kick-off request
    pub fn new(
        db: Arc<Database>,
        request: impl Into<String>,
        base_url: impl Into<String>,
        params: ExportParams,
        duration: Duration,
    ) -> Self {
        Self {
            state: TaskState::new(),
            db,
            request: request.into(),
            base_url: base_url.into(),
            params,
            duration,
            counts: Mutex::new(Vec::new()),
        }
    }

    /// The export manifest: one download link per resource type.
    ///
    /// Links point at the streaming download endpoint; a client following
    /// one replays the counted rows with the virtual-pagination parameters
    /// this job was kicked off with.
    pub fn export_manifest(&self) -> JobManifest {
        let snapshot = self.state.snapshot();
        let base = self.base_url.trim_end_matches('/');
        let output = lock_counts(&self.counts)
            .iter()
            .map(|(fhir_type, count)| {
                let mut url = format!(
                    "{base}/download/{fhir_type}?limit={}&m={}",
                    self.params.page_limit, self.params.multiplier
                );
                if let Some(group) = &self.params.group_id {
                    url.push_str(&format!("&group={}", urlencoding::encode(group)));
                }
                ManifestEntry {
                    kind: fhir_type.clone(),
                    input_url: None,
                    count: count * self.params.multiplier,
                    url,
                }
            })
            .collect();

        JobManifest {
            transaction_time: snapshot.end_time.unwrap_or_else(Utc::now),
            request: self.request.clone(),
            requires_access_token: false,
            output,
            error: Vec::new(),
        }
    }
}

#[async_trait]
impl Task for ExportTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    /// Resolve the requested resource types and count their rows
    async fn init(&self) -> Result<()> {
        let types = if self.params.resource_types.is_empty() {
            self.db.resource_types().await?
        } else {
            self.params.resource_types.clone()
        };

        let mut counts = Vec::with_capacity(types.len());
        for fhir_type in types {
            let count = self
                .db
                .count_resources(&fhir_type, self.params.group_id.as_deref())
                .await?;
            counts.push((fhir_type, count));
        }
        *lock_counts(&self.counts) = counts;

        self.state.set_total(EXPORT_TOTAL_UNITS);
        Ok(())
    }

    /// Advance progress over the simulated preparation window
    async fn start(&self) -> Result<()> {
        if lock_counts(&self.counts).is_empty() {
            self.init().await.inspect_err(|e| {
                self.state.end(Some(e.to_string()));
            })?;
        }
        self.state.mark_started();

        let step = self.duration / EXPORT_STEPS as u32;
        for i in 1..=EXPORT_STEPS {
            tokio::select! {
                _ = self.state.cancelled() => {
                    let err = Error::Cancelled(self.state.id().to_string());
                    self.state.end(Some(err.to_string()));
                    return Err(err);
                }
                _ = tokio::time::sleep(step) => {
                    // reaching the full unit count ends the task
                    self.state.set_position(i * EXPORT_TOTAL_UNITS / EXPORT_STEPS);
                }
            }
        }
        Ok(())
    }

    fn manifest(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.export_manifest()).ok()
    }
}

fn lock_counts(counts: &Mutex<Vec<(String, u64)>>) -> std::sync::MutexGuard<'_, Vec<(String, u64)>> {
    match counts.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

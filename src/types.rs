//! Core types for bulk-data-server

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

/// Unique identifier for a bulk export or import job.
///
/// Generated once when a task is constructed and never changed afterwards.
/// The value is an opaque 32-character lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random job id.
    pub fn random() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

/// Kind of bulk job tracked by the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Bulk import (ping-and-pull download of NDJSON files)
    Import,
    /// Bulk export (simulated dataset preparation)
    Export,
}

/// One input file descriptor from a bulk import kick-off request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ImportInput {
    /// Declared FHIR resource type of every record in the file
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Location of the NDJSON file to download
    #[schema(value_type = String)]
    pub url: Url,
}

/// Bulk import kick-off request body
///
/// Matches the Bulk Data Import "ping and pull" proposal: the client names
/// an input format, the system the data comes from, and one descriptor per
/// file to pull.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    /// MIME type of the input files (only `application/fhir+ndjson` is accepted)
    pub input_format: String,
    /// Base URL of the system the input files originate from
    pub input_source: String,
    /// Optional storage protocol details (accepted and ignored)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_detail: Option<serde_json::Value>,
    /// Files to import
    pub input: Vec<ImportInput>,
}

/// One entry in a completed job manifest (`output[]` or `error[]`)
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// FHIR type of the manifest entry (`OperationOutcome` for import
    /// entries, the exported resource type for export entries)
    #[serde(rename = "type")]
    pub kind: String,
    /// The input file this entry describes (import jobs only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_url: Option<String>,
    /// Number of validated resources processed from the file
    pub count: u64,
    /// Link to an outcome document describing success or failure
    pub url: String,
}

/// Structured summary of a completed bulk job
///
/// Returned as the status-poll response body once every file in the job has
/// reached a terminal state. `output` lists files that imported cleanly,
/// `error` lists files that failed, and the two always partition the full
/// input set.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    /// Instant the job's dataset snapshot is consistent with
    pub transaction_time: DateTime<Utc>,
    /// The kick-off request URL this manifest answers
    pub request: String,
    /// Whether downstream file links require an access token
    pub requires_access_token: bool,
    /// Successfully processed files
    pub output: Vec<ManifestEntry>,
    /// Failed files
    pub error: Vec<ManifestEntry>,
}

/// Event emitted over the server's broadcast channel during job lifecycles
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job accepted and registered
    JobQueued {
        /// Job ID
        id: JobId,
        /// Kind of job
        kind: JobKind,
    },

    /// Job progress update
    JobProgress {
        /// Job ID
        id: JobId,
        /// Progress percentage (0.0 to 100.0)
        percent: f64,
    },

    /// Job reached a terminal state without a job-level error
    JobCompleted {
        /// Job ID
        id: JobId,
    },

    /// Job reached a terminal state with an error
    JobFailed {
        /// Job ID
        id: JobId,
        /// Terminal failure description
        error: String,
    },

    /// Job removed from the registry (cancelled or evicted)
    JobRemoved {
        /// Job ID
        id: JobId,
    },
}

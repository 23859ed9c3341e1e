//! Download task for one remote NDJSON file
//!
//! A [`DownloadTask`] fetches one bulk import input file, streams its body
//! through the NDJSON parser, and validates every record's resource shape.
//! Byte-level progress (`position`) advances as raw chunks arrive,
//! independent of how many records have been parsed; `count` tracks
//! validated records.

use crate::error::{Error, Result, TransportError, ValidationError};
use crate::ndjson::NdjsonParser;
use crate::task::{Task, TaskState};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

/// Content types a bulk input file server may declare
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &[
    "application/fhir+ndjson",
    "application/ndjson",
    "application/x-ndjson",
    "application/json",
    "text/plain",
    "application/octet-stream",
];

/// Transport options for fetching bulk input files
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Reject plain-http file URLs
    pub require_https: bool,
    /// Redirect hop limit before the fetch is abandoned
    pub max_redirects: u32,
    /// NDJSON buffered-line overflow limit in bytes
    pub max_line_length: usize,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            require_https: true,
            max_redirects: 10,
            max_line_length: crate::ndjson::DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Task that downloads and validates one NDJSON file
pub struct DownloadTask {
    state: TaskState,
    url: Url,
    resource_type: String,
    options: DownloadOptions,
    /// Open response kept between `init` (headers inspected) and `start`
    /// (body consumed)
    response: Mutex<Option<reqwest::Response>>,
    /// Validated records parsed so far
    count: AtomicU64,
}

impl DownloadTask {
    /// Create a download task for one input file descriptor
    pub fn new(url: Url, resource_type: impl Into<String>, options: DownloadOptions) -> Self {
        Self {
            state: TaskState::new(),
            url,
            resource_type: resource_type.into(),
            options,
            response: Mutex::new(None),
            count: AtomicU64::new(0),
        }
    }

    /// The file URL this task downloads
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The declared resource type every record must match
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Number of validated resources parsed so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Issue the request and inspect status and headers without consuming
    /// the body. On success the open response is retained for `start`.
    async fn negotiate(&self) -> Result<reqwest::Response> {
        if self.options.require_https && self.url.scheme() != "https" {
            return Err(TransportError::InsecureUrl {
                url: self.url.to_string(),
            }
            .into());
        }

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(
                self.options.max_redirects as usize,
            ))
            .build()?;

        let response = client
            .get(self.url.clone())
            .header(ACCEPT, "application/fhir+ndjson")
            .send()
            .await
            .map_err(|e| {
                if e.is_redirect() {
                    Error::Transport(TransportError::TooManyRedirects {
                        url: self.url.to_string(),
                        limit: self.options.max_redirects,
                    })
                } else {
                    Error::Network(e)
                }
            })?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(TransportError::HttpStatus {
                url: self.url.to_string(),
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("").to_string(),
            }
            .into());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_str()) {
            return Err(TransportError::UnsupportedContentType {
                url: self.url.to_string(),
                content_type,
                accepted: ACCEPTED_CONTENT_TYPES.join(", "),
            }
            .into());
        }

        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        self.state.set_total(total);

        Ok(response)
    }

    /// Validate one parsed record against the declared resource type
    fn validate(&self, value: &Value, record: u64) -> Result<()> {
        let resource_type = value
            .get("resourceType")
            .and_then(Value::as_str)
            .unwrap_or("");
        if resource_type.is_empty() {
            return Err(ValidationError::MissingField {
                record,
                field: "resourceType",
            }
            .into());
        }
        if resource_type != self.resource_type {
            return Err(ValidationError::TypeMismatch {
                record,
                expected: self.resource_type.clone(),
                actual: resource_type.to_string(),
            }
            .into());
        }
        let id = value.get("id").and_then(Value::as_str).unwrap_or("");
        if id.is_empty() {
            return Err(ValidationError::MissingField { record, field: "id" }.into());
        }
        Ok(())
    }

    fn validate_all(&self, values: &[Value]) -> Result<()> {
        for value in values {
            let record = self.count.load(Ordering::Relaxed) + 1;
            self.validate(value, record)?;
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Consume the open response body, parsing and validating records.
    ///
    /// Position advances per chunk after the chunk's records have been
    /// checked, so a validation failure on the final chunk is recorded
    /// before the byte counter could auto-complete the task.
    async fn consume(&self, response: reqwest::Response) -> Result<()> {
        let mut parser = NdjsonParser::new(self.options.max_line_length);
        let mut stream = response.bytes_stream();

        loop {
            if self.state.cancellation_token().is_cancelled() {
                return Err(Error::Cancelled(self.url.to_string()));
            }
            tokio::select! {
                _ = self.state.cancelled() => {
                    return Err(Error::Cancelled(self.url.to_string()));
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let values = parser.push(&bytes)?;
                        self.validate_all(&values)?;
                        self.state.add_position(bytes.len() as u64);
                    }
                    Some(Err(e)) => return Err(Error::Network(e)),
                    None => {
                        if let Some(tail) = parser.finish()? {
                            self.validate_all(std::slice::from_ref(&tail))?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Task for DownloadTask {
    fn state(&self) -> &TaskState {
        &self.state
    }

    async fn init(&self) -> Result<()> {
        let response = self.negotiate().await?;
        *self.lock_response() = Some(response);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let response = self.lock_response().take();
        let response = match response {
            Some(response) => response,
            None => {
                self.init().await.inspect_err(|e| {
                    self.state.end(Some(e.to_string()));
                })?;
                self.lock_response()
                    .take()
                    .ok_or_else(|| Error::Other("download response unavailable".to_string()))?
            }
        };

        self.state.mark_started();
        match self.consume(response).await {
            Ok(()) => {
                self.state.end(None);
                Ok(())
            }
            Err(e) => {
                self.state.end(Some(e.to_string()));
                Err(e)
            }
        }
    }
}

impl DownloadTask {
    fn lock_response(&self) -> std::sync::MutexGuard<'_, Option<reqwest::Response>> {
        match self.response.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

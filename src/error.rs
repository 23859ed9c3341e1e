//! Error types for bulk-data-server
//!
//! This module provides comprehensive error handling for the library, including:
//! - Domain-specific error types (Transport, Parse, Validation, Admission)
//! - HTTP status code mapping for API integration
//! - FHIR `OperationOutcome` responses with machine-readable issue codes
//!
//! Task-level errors (transport, parse, validation) are recorded on the
//! failing task and reported through the job manifest; they never propagate
//! across task boundaries. Admission and not-found errors are rejected
//! synchronously at the API boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for bulk-data-server operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for bulk-data-server
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "export.page_limit")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Transport-level failure negotiating or fetching a bulk file
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// NDJSON stream parse failure
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Resource shape validation failure
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Request rejected at the API boundary before any work started
    #[error("admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Malformed request (bad body, missing required headers)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Requested input/output format is not supported
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Job or resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Task was cancelled before completing
    #[error("job cancelled: {0}")]
    Cancelled(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Transport and negotiation errors raised while fetching a bulk file
///
/// These are terminal for the task that hit them and are never retried by
/// the task itself.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The file URL does not use the required secure transport
    #[error("insecure file URL {url}: https is required")]
    InsecureUrl {
        /// The offending URL
        url: String,
    },

    /// The server redirected more than the allowed number of hops
    #[error("too many redirects fetching {url} (limit {limit})")]
    TooManyRedirects {
        /// The original file URL
        url: String,
        /// The redirect hop limit that was exceeded
        limit: u32,
    },

    /// The server answered with an HTTP error status
    #[error("fetching {url} returned {status} {message}")]
    HttpStatus {
        /// The file URL
        url: String,
        /// The HTTP status code
        status: u16,
        /// The status canonical reason or server-provided message
        message: String,
    },

    /// The response content type is not in the accepted set
    #[error("unacceptable content type \"{content_type}\" for {url}; expected one of: {accepted}")]
    UnsupportedContentType {
        /// The file URL
        url: String,
        /// The content type the server declared
        content_type: String,
        /// Comma-separated list of accepted content types
        accepted: String,
    },
}

/// NDJSON parse errors
#[derive(Debug, Error)]
pub enum ParseError {
    /// A line failed to parse as JSON
    #[error("syntax error on line {line}: {message}")]
    Syntax {
        /// 1-based line number of the malformed line
        line: u64,
        /// Underlying parser message
        message: String,
    },

    /// The accumulating buffer exceeded the configured maximum without a newline
    #[error("buffer overflow: {length} bytes buffered without a line break (limit {limit})")]
    BufferOverflow {
        /// The configured maximum buffered length
        limit: usize,
        /// The buffered length that tripped the limit
        length: usize,
    },

    /// The parser already failed permanently and rejects further input
    #[error("parser previously failed; no further input accepted")]
    Terminated,
}

/// Resource shape validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A record is missing a required field or has an empty value for it
    #[error("record {record} has no {field}")]
    MissingField {
        /// 1-based record number within the file
        record: u64,
        /// The missing or empty field name
        field: &'static str,
    },

    /// A record's resourceType does not match the declared file type
    #[error("record {record} has resourceType \"{actual}\", expected \"{expected}\"")]
    TypeMismatch {
        /// 1-based record number within the file
        record: u64,
        /// The declared type for the file
        expected: String,
        /// The type found on the record
        actual: String,
    },
}

/// Admission-control errors rejected synchronously at the API boundary
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// A job with this id is already registered (programmer error)
    #[error("a job with id {id} is already registered")]
    DuplicateJob {
        /// The conflicting job id
        id: String,
    },

    /// Another bulk job is already running; only one runs at a time
    #[error("another bulk job is in progress; retry in {retry_after} seconds")]
    JobAlreadyRunning {
        /// Suggested wait before retrying, in seconds
        retry_after: u64,
    },

    /// The client exceeded the per-minute request budget
    #[error("too many requests; retry in {retry_after} seconds")]
    RateLimited {
        /// Seconds until the sliding window frees a slot
        retry_after: u64,
    },
}

/// FHIR OperationOutcome returned by API endpoints
///
/// Every rejected operation yields one of these; there is no silent failure
/// path. The single issue carries a severity, a machine-readable code, and
/// a human-readable diagnostics string.
///
/// # Example JSON Response
///
/// ```json
/// {
///   "resourceType": "OperationOutcome",
///   "issue": [{
///     "severity": "error",
///     "code": "not-found",
///     "diagnostics": "not found: job f00ba4"
///   }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OperationOutcome {
    /// Always `"OperationOutcome"`
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    /// The issues this outcome reports (always exactly one here)
    pub issue: Vec<OutcomeIssue>,
}

/// One issue inside an [`OperationOutcome`]
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OutcomeIssue {
    /// Issue severity: `fatal`, `error`, `warning` or `information`
    pub severity: String,
    /// Machine-readable issue code (e.g., "not-found", "too-costly")
    pub code: String,
    /// Human-readable diagnostic message
    pub diagnostics: String,
}

impl OperationOutcome {
    /// Create an outcome with an explicit severity, code and diagnostics
    pub fn new(
        severity: impl Into<String>,
        code: impl Into<String>,
        diagnostics: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: "OperationOutcome".to_string(),
            issue: vec![OutcomeIssue {
                severity: severity.into(),
                code: code.into(),
                diagnostics: diagnostics.into(),
            }],
        }
    }

    /// Create an error-severity outcome
    pub fn error(code: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Self::new("error", code, diagnostics)
    }

    /// Create an information-severity outcome
    pub fn information(diagnostics: impl Into<String>) -> Self {
        Self::new("information", "informational", diagnostics)
    }
}

/// Convert errors to HTTP status codes for API responses
///
/// This trait maps domain errors to appropriate HTTP statuses and to the
/// machine-readable issue codes used in `OperationOutcome` bodies.
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable issue code
    fn issue_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - Client error (invalid input)
            Error::Config { .. } => 400,
            Error::InvalidRequest(_) => 400,
            Error::UnsupportedFormat(_) => 415,

            // 404 Not Found
            Error::NotFound(_) => 404,

            // Admission control
            Error::Admission(AdmissionError::DuplicateJob { .. }) => 409,
            Error::Admission(AdmissionError::JobAlreadyRunning { .. }) => 429,
            Error::Admission(AdmissionError::RateLimited { .. }) => 429,

            // 410 Gone - cancelled mid-flight
            Error::Cancelled(_) => 410,

            // 422 Unprocessable Entity - Semantic errors in the payload
            Error::Parse(_) => 422,
            Error::Validation(_) => 422,

            // 500 Internal Server Error - Server-side issues
            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - upstream file server errors
            Error::Transport(_) => 502,
            Error::Network(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
        }
    }

    fn issue_code(&self) -> &str {
        match self {
            Error::Config { .. } => "invalid",
            Error::InvalidRequest(_) => "invalid",
            Error::UnsupportedFormat(_) => "not-supported",
            Error::NotFound(_) => "not-found",
            Error::Cancelled(_) => "deleted",
            Error::Admission(e) => match e {
                AdmissionError::DuplicateJob { .. } => "duplicate",
                AdmissionError::JobAlreadyRunning { .. } => "too-costly",
                AdmissionError::RateLimited { .. } => "throttled",
            },
            Error::Transport(e) => match e {
                TransportError::InsecureUrl { .. } => "security",
                TransportError::TooManyRedirects { .. } => "transient",
                TransportError::HttpStatus { .. } => "transient",
                TransportError::UnsupportedContentType { .. } => "not-supported",
            },
            Error::Parse(_) => "structure",
            Error::Validation(_) => "invariant",
            Error::Database(_) | Error::Sqlx(_) => "exception",
            Error::Io(_) => "exception",
            Error::Serialization(_) => "exception",
            Error::ApiServerError(_) => "exception",
            Error::Network(_) => "transient",
            Error::ShuttingDown => "transient",
            Error::Other(_) => "exception",
        }
    }
}

impl From<Error> for OperationOutcome {
    fn from(error: Error) -> Self {
        OperationOutcome::error(error.issue_code().to_string(), error.to_string())
    }
}

impl Error {
    /// Seconds the client should wait before retrying, when the error carries one
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Error::Admission(AdmissionError::JobAlreadyRunning { retry_after })
            | Error::Admission(AdmissionError::RateLimited { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Helpers: construct every Error variant for status/issue_code tests
    // -----------------------------------------------------------------------

    /// Returns a vec of (Error, expected_status_code, expected_issue_code) for
    /// every reachable match arm in ToHttpStatus.
    fn all_error_variants() -> Vec<(Error, u16, &'static str)> {
        vec![
            (
                Error::Config {
                    message: "bad value".into(),
                    key: Some("export.page_limit".into()),
                },
                400,
                "invalid",
            ),
            (
                Error::InvalidRequest("input array is empty".into()),
                400,
                "invalid",
            ),
            (
                Error::UnsupportedFormat("application/xml".into()),
                415,
                "not-supported",
            ),
            (Error::NotFound("job f00ba4".into()), 404, "not-found"),
            (Error::Cancelled("job f00ba4".into()), 410, "deleted"),
            (
                Error::Admission(AdmissionError::DuplicateJob { id: "abc".into() }),
                409,
                "duplicate",
            ),
            (
                Error::Admission(AdmissionError::JobAlreadyRunning { retry_after: 12 }),
                429,
                "too-costly",
            ),
            (
                Error::Admission(AdmissionError::RateLimited { retry_after: 30 }),
                429,
                "throttled",
            ),
            (
                Error::Transport(TransportError::InsecureUrl {
                    url: "http://files.example.com/a.ndjson".into(),
                }),
                502,
                "security",
            ),
            (
                Error::Transport(TransportError::TooManyRedirects {
                    url: "https://files.example.com/a.ndjson".into(),
                    limit: 10,
                }),
                502,
                "transient",
            ),
            (
                Error::Transport(TransportError::HttpStatus {
                    url: "https://files.example.com/a.ndjson".into(),
                    status: 404,
                    message: "Not Found".into(),
                }),
                502,
                "transient",
            ),
            (
                Error::Transport(TransportError::UnsupportedContentType {
                    url: "https://files.example.com/a.ndjson".into(),
                    content_type: "text/html".into(),
                    accepted: "application/fhir+ndjson".into(),
                }),
                502,
                "not-supported",
            ),
            (
                Error::Parse(ParseError::Syntax {
                    line: 3,
                    message: "expected value".into(),
                }),
                422,
                "structure",
            ),
            (
                Error::Parse(ParseError::BufferOverflow {
                    limit: 2,
                    length: 15,
                }),
                422,
                "structure",
            ),
            (
                Error::Validation(ValidationError::MissingField {
                    record: 1,
                    field: "id",
                }),
                422,
                "invariant",
            ),
            (
                Error::Validation(ValidationError::TypeMismatch {
                    record: 2,
                    expected: "Patient".into(),
                    actual: "Observation".into(),
                }),
                422,
                "invariant",
            ),
            (
                Error::Database(DatabaseError::QueryFailed("timeout".into())),
                500,
                "exception",
            ),
            (
                Error::Io(std::io::Error::other("disk fail")),
                500,
                "exception",
            ),
            (
                Error::ApiServerError("bind failed".into()),
                500,
                "exception",
            ),
            (Error::Other("unknown".into()), 500, "exception"),
            (Error::ShuttingDown, 503, "transient"),
        ]
    }

    #[test]
    fn every_variant_maps_to_expected_status_code() {
        for (error, expected_status, expected_code) in all_error_variants() {
            let actual_status = error.status_code();
            assert_eq!(
                actual_status, expected_status,
                "Error variant with issue_code={expected_code} returned status {actual_status}, expected {expected_status}"
            );
        }
    }

    #[test]
    fn every_variant_maps_to_expected_issue_code() {
        for (error, expected_status, expected_code) in all_error_variants() {
            let actual_code = error.issue_code();
            assert_eq!(
                actual_code, expected_code,
                "Error variant with expected status={expected_status} returned issue_code={actual_code}, expected {expected_code}"
            );
        }
    }

    #[test]
    fn rate_limited_carries_retry_after() {
        let err = Error::Admission(AdmissionError::RateLimited { retry_after: 42 });
        assert_eq!(err.retry_after(), Some(42));
    }

    #[test]
    fn job_already_running_carries_retry_after() {
        let err = Error::Admission(AdmissionError::JobAlreadyRunning { retry_after: 7 });
        assert_eq!(err.retry_after(), Some(7));
    }

    #[test]
    fn most_errors_have_no_retry_after() {
        assert_eq!(Error::NotFound("x".into()).retry_after(), None);
        assert_eq!(Error::ShuttingDown.retry_after(), None);
    }

    #[test]
    fn outcome_from_error_preserves_display_message() {
        let err = Error::Validation(ValidationError::TypeMismatch {
            record: 5,
            expected: "Patient".into(),
            actual: "Device".into(),
        });
        let display = err.to_string();
        let outcome: OperationOutcome = err.into();

        assert_eq!(outcome.resource_type, "OperationOutcome");
        assert_eq!(outcome.issue.len(), 1);
        assert_eq!(outcome.issue[0].severity, "error");
        assert_eq!(outcome.issue[0].code, "invariant");
        assert_eq!(outcome.issue[0].diagnostics, display);
    }

    #[test]
    fn outcome_serializes_with_fhir_resource_type() {
        let outcome = OperationOutcome::error("not-found", "not found: job abc");
        let json = serde_json::to_value(&outcome).unwrap();

        assert_eq!(json["resourceType"], "OperationOutcome");
        assert_eq!(json["issue"][0]["severity"], "error");
        assert_eq!(json["issue"][0]["code"], "not-found");
        assert_eq!(json["issue"][0]["diagnostics"], "not found: job abc");
    }

    #[test]
    fn information_outcome_has_information_severity() {
        let outcome = OperationOutcome::information("import accepted");
        assert_eq!(outcome.issue[0].severity, "information");
        assert_eq!(outcome.issue[0].diagnostics, "import accepted");
    }

    #[test]
    fn transport_error_messages_name_the_offender() {
        let err = Error::Transport(TransportError::UnsupportedContentType {
            url: "https://files.example.com/a.ndjson".into(),
            content_type: "text/html".into(),
            accepted: "application/fhir+ndjson, application/json".into(),
        });
        let msg = err.to_string();
        assert!(msg.contains("text/html"));
        assert!(msg.contains("application/fhir+ndjson"));
    }

    #[test]
    fn parse_errors_cite_one_based_line_numbers() {
        let err = Error::Parse(ParseError::Syntax {
            line: 1,
            message: "expected `:`".into(),
        });
        assert!(err.to_string().contains("line 1"));
    }
}

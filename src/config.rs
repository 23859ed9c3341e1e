//! Configuration types for bulk-data-server

use serde::{Deserialize, Serialize};
use std::{net::IpAddr, net::SocketAddr, path::PathBuf, time::Duration};
use utoipa::ToSchema;

/// REST API configuration (bind address, CORS, rate limiting)
///
/// Groups settings for the HTTP surface. Used as a nested sub-config within
/// [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Address the API server binds to (default: 127.0.0.1:9444)
    #[serde(default = "default_bind_address")]
    #[schema(value_type = String)]
    pub bind_address: SocketAddr,

    /// Public base URL used when building polling and download links
    /// (default: "http://localhost:9444")
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Enable CORS middleware (default: true)
    #[serde(default = "default_true")]
    pub cors_enabled: bool,

    /// Allowed CORS origins ("*" allows any origin)
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Serve the interactive Swagger UI at /swagger-ui (default: false)
    #[serde(default)]
    pub swagger_ui: bool,

    /// Per-client request rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            base_url: default_base_url(),
            cors_enabled: true,
            cors_origins: default_cors_origins(),
            swagger_ui: false,
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Rate limiting configuration (sliding one-minute window per client IP)
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RateLimitConfig {
    /// Whether rate limiting is enforced (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum requests allowed per window per client IP (default: 100)
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Paths exempt from rate limiting (exact or prefix match)
    #[serde(default)]
    pub exempt_paths: Vec<String>,

    /// Client IPs exempt from rate limiting
    #[serde(default)]
    #[schema(value_type = Vec<String>)]
    pub exempt_ips: Vec<IpAddr>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
            exempt_paths: Vec::new(),
            exempt_ips: Vec::new(),
        }
    }
}

/// Bulk import configuration (file fetching and validation)
///
/// Groups settings for the ping-and-pull import pipeline. Used as a nested
/// sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ImportConfig {
    /// Require https for input file URLs (default: true; disable for local testing)
    #[serde(default = "default_true")]
    pub require_https: bool,

    /// Maximum redirect hops followed when fetching a file (default: 10)
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,

    /// Maximum bytes buffered while waiting for a line break in an NDJSON
    /// stream (default: 1 MiB). Protects against unbounded memory growth
    /// from EOL-less input.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Seconds a finished job stays pollable before eviction (default: 60)
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Retry-After hint returned while a job is still running (default: 5)
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,

    /// Retry-After hint used when the remaining-time estimate is unknown
    /// (default: 10)
    #[serde(default = "default_fallback_retry_after_secs")]
    pub fallback_retry_after_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            require_https: true,
            max_redirects: default_max_redirects(),
            max_line_length: default_max_line_length(),
            grace_period_secs: default_grace_period_secs(),
            retry_after_secs: default_retry_after_secs(),
            fallback_retry_after_secs: default_fallback_retry_after_secs(),
        }
    }
}

/// Bulk export configuration (pagination, throttling, simulation)
///
/// Groups settings for the streaming download endpoint and the simulated
/// export preparation phase. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ExportConfig {
    /// Default rows per download response when the client omits `limit`
    /// (default: 100)
    #[serde(default = "default_page_limit")]
    pub default_page_limit: u64,

    /// Hard cap on rows per download response (default: 100000)
    #[serde(default = "default_max_page_limit")]
    pub max_page_limit: u64,

    /// Default dataset multiplier when the client omits `m` (default: 1)
    #[serde(default = "default_multiplier")]
    pub default_multiplier: u64,

    /// Artificial delay between emitted rows, in milliseconds (default: 1)
    #[serde(default = "default_row_delay_ms")]
    pub row_delay_ms: u64,

    /// Simulated preparation time for async export jobs, in seconds
    /// (default: 2)
    #[serde(default = "default_export_duration_secs")]
    pub simulated_duration_secs: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_page_limit: default_page_limit(),
            max_page_limit: default_max_page_limit(),
            default_multiplier: default_multiplier(),
            row_delay_ms: default_row_delay_ms(),
            simulated_duration_secs: default_export_duration_secs(),
        }
    }
}

/// Persistence configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PersistenceConfig {
    /// Path to the SQLite database file (default: "./bulk-data.db")
    #[serde(default = "default_database_path")]
    #[schema(value_type = String)]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Main configuration for the bulk data server
///
/// Fields are organized into logical sub-configs:
/// - [`api`](ApiConfig) — bind address, base URL, CORS, rate limiting
/// - [`import`](ImportConfig) — file fetching, validation, job eviction
/// - [`export`](ExportConfig) — pagination, throttling, simulation
/// - [`persistence`](PersistenceConfig) — database location
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// REST API settings
    #[serde(default)]
    pub api: ApiConfig,

    /// Bulk import settings
    #[serde(default)]
    pub import: ImportConfig,

    /// Bulk export settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Grace period a finished job stays pollable, as a [`Duration`]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.import.grace_period_secs)
    }

    /// Artificial per-row delay for export streaming, as a [`Duration`]
    pub fn row_delay(&self) -> Duration {
        Duration::from_millis(self.export.row_delay_ms)
    }

    /// Simulated export preparation time, as a [`Duration`]
    pub fn simulated_export_duration(&self) -> Duration {
        Duration::from_secs(self.export.simulated_duration_secs)
    }
}

fn default_bind_address() -> SocketAddr {
    "127.0.0.1:9444".parse().unwrap_or_else(|_| {
        // Unreachable: the literal above always parses
        SocketAddr::from(([127, 0, 0, 1], 9444))
    })
}

fn default_base_url() -> String {
    "http://localhost:9444".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_redirects() -> u32 {
    10
}

fn default_max_line_length() -> usize {
    1024 * 1024
}

fn default_grace_period_secs() -> u64 {
    60
}

fn default_retry_after_secs() -> u64 {
    5
}

fn default_fallback_retry_after_secs() -> u64 {
    10
}

fn default_page_limit() -> u64 {
    100
}

fn default_max_page_limit() -> u64 {
    100_000
}

fn default_multiplier() -> u64 {
    1
}

fn default_row_delay_ms() -> u64 {
    1
}

fn default_export_duration_secs() -> u64 {
    2
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./bulk-data.db")
}

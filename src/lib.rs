//! # bulk-data-server
//!
//! Reference implementation of the FHIR Bulk Data export/import flows,
//! built for testing bulk data clients against realistic server behavior.
//!
//! ## Design Philosophy
//!
//! bulk-data-server is designed to be:
//! - **A test harness, not a product** - Simulated datasets, predictable
//!   behavior, no durability guarantees
//! - **Library-first** - The HTTP surface is a thin layer over an embeddable
//!   crate
//! - **Event-driven** - Consumers subscribe to job events, no polling
//!   required inside the process
//!
//! ## Quick Start
//!
//! ```no_run
//! use bulk_data_server::{BulkDataServer, Config};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let server = Arc::new(BulkDataServer::new(config).await?);
//!
//!     // Subscribe to job events
//!     let mut events = server.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Serve the REST API until a termination signal arrives
//!     server.spawn_api_server();
//!     bulk_data_server::run_with_shutdown(&server).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Incremental NDJSON parsing
pub mod ndjson;
/// Virtual pagination engine
pub mod paging;
/// Top-level server instance
pub mod server;
/// Asynchronous task lifecycle engine
pub mod task;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{ApiConfig, Config, ExportConfig, ImportConfig, RateLimitConfig};
pub use db::Database;
pub use error::{
    AdmissionError, Error, OperationOutcome, OutcomeIssue, ParseError, Result, ToHttpStatus,
    TransportError, ValidationError,
};
pub use ndjson::NdjsonParser;
pub use paging::{ExportOptions, OutputFormat, PageCursor};
pub use server::BulkDataServer;
pub use task::{
    DownloadTask, DownloadTaskCollection, ExportTask, Task, TaskManager, TaskSnapshot, TaskState,
};
pub use types::{Event, ImportInput, ImportRequest, JobId, JobKind, JobManifest, ManifestEntry};

/// Helper function to run the server with graceful signal handling.
///
/// Waits for a termination signal and then calls the server's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(server: &BulkDataServer) -> Result<()> {
    wait_for_signal().await;
    server.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}

//! Application state for the API server

use crate::{BulkDataServer, Config};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// This struct is cloned for each request (cheap Arc clone) and provides
/// access to the server instance and configuration.
#[derive(Clone)]
pub struct AppState {
    /// The main BulkDataServer instance
    pub server: Arc<BulkDataServer>,

    /// Configuration (for read access)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(server: Arc<BulkDataServer>, config: Arc<Config>) -> Self {
        Self { server, config }
    }
}

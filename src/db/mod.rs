//! Database layer for bulk-data-server
//!
//! Handles SQLite persistence for the ingested-resource `data` table that
//! backs the export/download streaming engine.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`resources`] — Resource row CRUD, counting, and the restartable
//!   [`RowCursor`](resources::RowCursor) used by virtual pagination

use sqlx::{FromRow, sqlite::SqlitePool};

mod migrations;
mod resources;

pub use resources::{NewResource, RowCursor};

/// One ingested resource row from the `data` table
#[derive(Debug, Clone, FromRow)]
pub struct DataRow {
    /// Unique database ID
    pub id: i64,
    /// Patient this resource belongs to, when one can be derived
    pub patient_id: Option<String>,
    /// Raw resource JSON text
    pub resource_json: String,
    /// FHIR resource type of the row
    pub fhir_type: String,
    /// Optional group the patient belongs to
    pub group_id: Option<String>,
    /// Unix timestamp when the row was ingested
    pub created_at: i64,
    /// Unix timestamp when the row was last modified
    pub modified_at: i64,
}

/// Database handle for bulk-data-server
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// The underlying connection pool (for cursors that outlive a borrow)
    pub(crate) fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

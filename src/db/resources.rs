//! Resource row CRUD and the restartable row cursor.

use crate::error::{DatabaseError, Error, Result};
use serde_json::Value;
use sqlx::sqlite::SqlitePool;
use std::collections::VecDeque;

use super::{DataRow, Database};

/// Rows fetched per query by [`RowCursor`]
const CURSOR_FETCH_SIZE: u64 = 64;

/// New resource row to be inserted into the `data` table
#[derive(Debug, Clone)]
pub struct NewResource {
    /// Patient this resource belongs to, when one can be derived
    pub patient_id: Option<String>,
    /// Raw resource JSON text
    pub resource_json: String,
    /// FHIR resource type of the row
    pub fhir_type: String,
    /// Optional group the patient belongs to
    pub group_id: Option<String>,
}

impl Database {
    /// Insert one resource row, returning its database id
    pub async fn insert_resource(&self, resource: &NewResource) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO data (patient_id, resource_json, fhir_type, group_id, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&resource.patient_id)
        .bind(&resource.resource_json)
        .bind(&resource.fhir_type)
        .bind(&resource.group_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert resource: {}",
                e
            )))
        })?;
        Ok(result.last_insert_rowid())
    }

    /// Count rows of one resource type, optionally scoped to a group
    pub async fn count_resources(
        &self,
        fhir_type: &str,
        group_id: Option<&str>,
    ) -> Result<u64> {
        let count: i64 = match group_id {
            Some(group) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM data WHERE fhir_type = ? AND group_id = ?")
                    .bind(fhir_type)
                    .bind(group)
                    .fetch_one(&self.pool)
                    .await
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM data WHERE fhir_type = ?")
                .bind(fhir_type)
                .fetch_one(&self.pool)
                .await,
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count resources: {}",
                e
            )))
        })?;
        Ok(count.max(0) as u64)
    }

    /// Distinct resource types currently ingested, alphabetically
    pub async fn resource_types(&self) -> Result<Vec<String>> {
        sqlx::query_scalar("SELECT DISTINCT fhir_type FROM data ORDER BY fhir_type")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to list resource types: {}",
                    e
                )))
            })
    }

    /// Ingest an NDJSON document, one resource row per line.
    ///
    /// Every record must carry a `resourceType`; the patient id is derived
    /// from the record itself (a Patient's own id, or the record's
    /// subject/patient reference). Returns the number of rows inserted.
    pub async fn seed_ndjson(&self, text: &str, group_id: Option<&str>) -> Result<u64> {
        let mut parser = crate::ndjson::NdjsonParser::default();
        let mut values = parser.push(text.as_bytes())?;
        if let Some(tail) = parser.finish()? {
            values.push(tail);
        }

        let mut inserted = 0;
        for value in values {
            let fhir_type = value
                .get("resourceType")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::InvalidRequest("seed record has no resourceType".to_string())
                })?
                .to_string();
            let resource = NewResource {
                patient_id: patient_reference(&value),
                resource_json: serde_json::to_string(&value)?,
                fhir_type,
                group_id: group_id.map(str::to_string),
            };
            self.insert_resource(&resource).await?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Open a restartable cursor over one resource type.
    ///
    /// The cursor starts at `offset` rows into the (id-ordered) result set
    /// and fetches in batches; [`RowCursor::rewind`] resets it to offset 0
    /// so the same underlying rows can be replayed.
    pub fn row_cursor(
        &self,
        fhir_type: impl Into<String>,
        group_id: Option<String>,
        offset: u64,
    ) -> RowCursor {
        RowCursor {
            pool: self.pool(),
            fhir_type: fhir_type.into(),
            group_id,
            offset,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

/// Derive the owning patient id from a resource record
fn patient_reference(value: &Value) -> Option<String> {
    if value.get("resourceType").and_then(Value::as_str) == Some("Patient") {
        return value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string);
    }
    for key in ["subject", "patient"] {
        if let Some(reference) = value
            .get(key)
            .and_then(|v| v.get("reference"))
            .and_then(Value::as_str)
        {
            let id = reference.strip_prefix("Patient/").unwrap_or(reference);
            return Some(id.to_string());
        }
    }
    None
}

/// Forward-only cursor over the `data` table that can be rewound to row 0
///
/// This is the restartable cursor underneath virtual pagination: one
/// outbound response owns one cursor exclusively, pulls rows one at a
/// time, and rewinds it when the real data runs out before the virtual
/// quota is met.
pub struct RowCursor {
    pool: SqlitePool,
    fhir_type: String,
    group_id: Option<String>,
    /// Offset of the next batch fetch
    offset: u64,
    buffer: VecDeque<DataRow>,
    exhausted: bool,
}

impl RowCursor {
    /// Pull the next row, or `None` when the result set is exhausted
    pub async fn next(&mut self) -> Result<Option<DataRow>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch_batch().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// Reset the cursor to row 0, discarding any buffered rows
    pub fn rewind(&mut self) {
        self.offset = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        let rows: Vec<DataRow> = match &self.group_id {
            Some(group) => {
                sqlx::query_as(
                    r#"
                    SELECT id, patient_id, resource_json, fhir_type, group_id, created_at, modified_at
                    FROM data WHERE fhir_type = ? AND group_id = ?
                    ORDER BY id LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&self.fhir_type)
                .bind(group)
                .bind(CURSOR_FETCH_SIZE as i64)
                .bind(self.offset as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, patient_id, resource_json, fhir_type, group_id, created_at, modified_at
                    FROM data WHERE fhir_type = ?
                    ORDER BY id LIMIT ? OFFSET ?
                    "#,
                )
                .bind(&self.fhir_type)
                .bind(CURSOR_FETCH_SIZE as i64)
                .bind(self.offset as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to fetch cursor batch: {}",
                e
            )))
        })?;

        if (rows.len() as u64) < CURSOR_FETCH_SIZE {
            self.exhausted = true;
        }
        self.offset += rows.len() as u64;
        self.buffer.extend(rows);
        Ok(())
    }
}

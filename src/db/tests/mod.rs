use super::*;

mod resources;

use tempfile::NamedTempFile;

/// Helper to create a migrated database in a temp file.
/// Returns the database and the temp file (which must be kept alive).
pub(crate) async fn create_test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

/// Insert `count` Patient rows with predictable UUID-shaped ids
pub(crate) async fn seed_patients(db: &Database, count: usize) {
    for i in 0..count {
        let id = format!("00000000-0000-0000-0000-{i:012}");
        db.insert_resource(&NewResource {
            patient_id: Some(id.clone()),
            resource_json: format!("{{\"resourceType\":\"Patient\",\"id\":\"{id}\"}}"),
            fhir_type: "Patient".to_string(),
            group_id: None,
        })
        .await
        .unwrap();
    }
}

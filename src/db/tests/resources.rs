use super::*;

#[tokio::test]
async fn insert_and_count_resources() {
    let (db, _file) = create_test_db().await;

    let id = db
        .insert_resource(&NewResource {
            patient_id: Some("p1".to_string()),
            resource_json: "{\"resourceType\":\"Patient\",\"id\":\"p1\"}".to_string(),
            fhir_type: "Patient".to_string(),
            group_id: None,
        })
        .await
        .unwrap();
    assert!(id > 0);

    assert_eq!(db.count_resources("Patient", None).await.unwrap(), 1);
    assert_eq!(db.count_resources("Observation", None).await.unwrap(), 0);

    db.close().await;
}

#[tokio::test]
async fn count_respects_group_scope() {
    let (db, _file) = create_test_db().await;

    for group in [Some("g1"), Some("g1"), Some("g2"), None] {
        db.insert_resource(&NewResource {
            patient_id: None,
            resource_json: "{\"resourceType\":\"Patient\",\"id\":\"x\"}".to_string(),
            fhir_type: "Patient".to_string(),
            group_id: group.map(str::to_string),
        })
        .await
        .unwrap();
    }

    assert_eq!(db.count_resources("Patient", Some("g1")).await.unwrap(), 2);
    assert_eq!(db.count_resources("Patient", Some("g2")).await.unwrap(), 1);
    assert_eq!(db.count_resources("Patient", None).await.unwrap(), 4);

    db.close().await;
}

#[tokio::test]
async fn resource_types_are_distinct_and_sorted() {
    let (db, _file) = create_test_db().await;

    for fhir_type in ["Observation", "Patient", "Observation"] {
        db.insert_resource(&NewResource {
            patient_id: None,
            resource_json: format!("{{\"resourceType\":\"{fhir_type}\",\"id\":\"x\"}}"),
            fhir_type: fhir_type.to_string(),
            group_id: None,
        })
        .await
        .unwrap();
    }

    assert_eq!(
        db.resource_types().await.unwrap(),
        vec!["Observation".to_string(), "Patient".to_string()]
    );

    db.close().await;
}

#[tokio::test]
async fn seed_ndjson_derives_patient_references() {
    let (db, _file) = create_test_db().await;

    let text = "{\"resourceType\":\"Patient\",\"id\":\"pat-1\"}\n\
                {\"resourceType\":\"Observation\",\"id\":\"obs-1\",\"subject\":{\"reference\":\"Patient/pat-1\"}}\n\
                {\"resourceType\":\"Device\",\"id\":\"dev-1\",\"patient\":{\"reference\":\"Patient/pat-1\"}}\n";
    let inserted = db.seed_ndjson(text, Some("g1")).await.unwrap();
    assert_eq!(inserted, 3);

    let mut cursor = db.row_cursor("Observation", None, 0);
    let row = cursor.next().await.unwrap().unwrap();
    assert_eq!(row.patient_id.as_deref(), Some("pat-1"));
    assert_eq!(row.group_id.as_deref(), Some("g1"));

    db.close().await;
}

#[tokio::test]
async fn seed_ndjson_rejects_records_without_resource_type() {
    let (db, _file) = create_test_db().await;

    let err = db.seed_ndjson("{\"id\":\"x\"}\n", None).await.unwrap_err();
    assert!(err.to_string().contains("resourceType"), "got: {err}");

    db.close().await;
}

#[tokio::test]
async fn cursor_iterates_in_id_order_across_batches() {
    let (db, _file) = create_test_db().await;
    // more rows than one fetch batch to cross the batch boundary
    seed_patients(&db, 150).await;

    let mut cursor = db.row_cursor("Patient", None, 0);
    let mut seen = 0;
    let mut last_id = 0;
    while let Some(row) = cursor.next().await.unwrap() {
        assert!(row.id > last_id, "rows must arrive in id order");
        last_id = row.id;
        seen += 1;
    }
    assert_eq!(seen, 150);

    db.close().await;
}

#[tokio::test]
async fn cursor_starts_at_offset() {
    let (db, _file) = create_test_db().await;
    seed_patients(&db, 10).await;

    let mut cursor = db.row_cursor("Patient", None, 7);
    let mut seen = 0;
    while cursor.next().await.unwrap().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 3);

    db.close().await;
}

#[tokio::test]
async fn rewind_replays_from_the_first_row() {
    let (db, _file) = create_test_db().await;
    seed_patients(&db, 5).await;

    let mut cursor = db.row_cursor("Patient", None, 3);
    let first = cursor.next().await.unwrap().unwrap();
    while cursor.next().await.unwrap().is_some() {}

    cursor.rewind();
    let replayed = cursor.next().await.unwrap().unwrap();
    assert!(replayed.id < first.id, "rewind must restart at row 0");

    let mut seen = 1;
    while cursor.next().await.unwrap().is_some() {
        seen += 1;
    }
    assert_eq!(seen, 5);

    db.close().await;
}

#[tokio::test]
async fn exhausted_cursor_keeps_returning_none() {
    let (db, _file) = create_test_db().await;
    seed_patients(&db, 1).await;

    let mut cursor = db.row_cursor("Patient", None, 0);
    assert!(cursor.next().await.unwrap().is_some());
    assert!(cursor.next().await.unwrap().is_none());
    assert!(cursor.next().await.unwrap().is_none());

    db.close().await;
}

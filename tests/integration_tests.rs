use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tagvault::types::DocumentLimit;
use tagvault::*;

fn catalog() -> Vec<TagDefinition> {
    vec![
        TagDefinition::object("Boiler"),
        TagDefinition::variable("Boiler.Temp", "Boiler").with_attribute("unit", json!("C")),
        TagDefinition::variable("Boiler.Pressure", "Boiler").with_retention(RetentionPolicy {
            bucket_size: Some(BucketSize(1, TimeUnit::Days)),
            max_documents: Some(DocumentLimit::Count(10)),
        }),
        TagDefinition::method("Boiler.Reset", "Boiler"),
        TagDefinition::group_owner("Boiler.Status", "Boiler"),
        TagDefinition::group_member("Boiler.Status.Flame", "Boiler", "Boiler.Status"),
        TagDefinition::group_member("Boiler.Status.Fan", "Boiler", "Boiler.Status"),
    ]
}

async fn vault_with_catalog() -> TagVault {
    let vault = TagVault::in_memory().await.unwrap();
    vault.sync_definitions(&catalog(), SyncMode::Local).await.unwrap();
    vault
}

fn value(tag: &str, key: &str, v: serde_json::Value) -> Notification {
    Notification::Value(Sample::new(tag, key, v))
}

#[tokio::test]
async fn test_sync_twice_reports_no_changes() {
    let vault = TagVault::in_memory().await.unwrap();
    let first = vault.sync_definitions(&catalog(), SyncMode::Local).await.unwrap();
    assert_eq!(first.added, 7);
    let second = vault.sync_definitions(&catalog(), SyncMode::Local).await.unwrap();
    assert_eq!(
        second,
        SyncReport { added: 0, updated: 0, deleted: 0, total: 7 }
    );
    assert!(vault.audit(&AuditScope::Local).await.unwrap());
}

#[tokio::test]
async fn test_written_value_reads_back() {
    let vault = vault_with_catalog().await;
    vault
        .ingest(value("Boiler.Temp", "2022-01-05T08:30:00Z", json!(64.25)))
        .await
        .unwrap();
    let doc = vault
        .values()
        .bucket_for("Boiler.Temp", "2022-01-05T08:30:00Z")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.entry("2022-01-05T08:30:00Z").unwrap().value, json!(64.25));
}

#[tokio::test]
async fn test_monthly_buckets() {
    let vault = vault_with_catalog().await;
    for (key, v) in [("2022-01-05", 1), ("2022-01-20", 2), ("2022-02-01", 3)] {
        vault.ingest(value("Boiler.Temp", key, json!(v))).await.unwrap();
    }
    let docs = vault.documents("Boiler.Temp").await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].entries.len(), 2);
    assert_eq!(docs[1].bucket_start, "2022-02-01");
}

#[tokio::test]
async fn test_containment_not_overlap_selects_bucket() {
    let vault = vault_with_catalog().await;
    vault.ingest(value("Boiler.Temp", "2022-01-05", json!(1))).await.unwrap();
    vault.ingest(value("Boiler.Temp", "2022-01-20", json!(2))).await.unwrap();

    // Shrink the bucket to weeks. 2022-01-18 falls inside the existing [01-05, 01-20]
    // document, but that document is not inside the week of 01-17, so a new one starts.
    let mut defs = catalog();
    defs[1] = TagDefinition::variable("Boiler.Temp", "Boiler")
        .with_attribute("unit", json!("C"))
        .with_retention(RetentionPolicy {
            bucket_size: Some(BucketSize(1, TimeUnit::Weeks)),
            max_documents: None,
        });
    vault.sync_definitions(&defs, SyncMode::Local).await.unwrap();

    vault.ingest(value("Boiler.Temp", "2022-01-18", json!(3))).await.unwrap();
    let docs = vault.documents("Boiler.Temp").await.unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0].entries.len(), 2);
    assert_eq!(docs[1].bucket_start, "2022-01-18");
}

#[tokio::test]
async fn test_same_key_written_twice_keeps_latest() {
    let vault = vault_with_catalog().await;
    vault.ingest(value("Boiler.Temp", "2022-01-05", json!(1))).await.unwrap();
    vault.ingest(value("Boiler.Temp", "2022-01-05", json!(9))).await.unwrap();
    let history = vault.history("Boiler.Temp").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].values["Boiler.Temp"], json!(9));
}

#[tokio::test]
async fn test_retention_keeps_ten_most_recent_documents() {
    let vault = vault_with_catalog().await;
    for day in 1..=15 {
        let key = format!("2022-01-{:02}", day);
        vault.ingest(value("Boiler.Pressure", &key, json!(day))).await.unwrap();
    }
    let docs = vault.documents("Boiler.Pressure").await.unwrap();
    assert_eq!(docs.len(), 10);
    assert_eq!(docs.first().unwrap().bucket_start, "2022-01-06");
    assert_eq!(docs.last().unwrap().bucket_start, "2022-01-15");
}

#[tokio::test]
async fn test_group_sample_fans_out_to_members() {
    let vault = vault_with_catalog().await;
    let payload = json!({
        "timestamp": "2022-01-05T12:00:00Z",
        "envelope": {"quality": "good"},
        "Boiler.Status.Flame": true,
        "Boiler.Status.Fan": 1450
    });
    vault
        .ingest(Notification::Group(
            GroupSample::from_payload("Boiler.Status", &payload).unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(vault.documents("Boiler.Status.Flame").await.unwrap().len(), 1);
    let history = vault.history("Boiler.Status").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].values.len(), 2);
    assert_eq!(history[0].envelope, Some(json!({"quality": "good"})));
}

#[tokio::test]
async fn test_objects_and_methods_never_get_documents() {
    let vault = vault_with_catalog().await;
    for tag in ["Boiler", "Boiler.Reset"] {
        let err = vault.ingest(value(tag, "2022-01-05", json!(1))).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)), "{tag}: {err:?}");
        assert!(vault.documents(tag).await.unwrap().is_empty());
    }
    assert!(vault.audit(&AuditScope::Local).await.unwrap());
}

#[tokio::test]
async fn test_removing_object_cascades_in_one_audit() {
    let vault = vault_with_catalog().await;
    vault.ingest(value("Boiler.Temp", "2022-01-05", json!(1))).await.unwrap();

    // Drop the object from the authoritative list but keep its children; the auditor then
    // clears the orphans, the members of the orphaned group, and their documents.
    let children: Vec<TagDefinition> = catalog().into_iter().skip(1).collect();
    vault.sync_definitions(&children, SyncMode::Local).await.unwrap();

    let report = vault.audit_report(&AuditScope::Local).await.unwrap();
    assert_eq!(report.corrections(AuditPass::OrphanVariables), 6);
    assert_eq!(report.corrections(AuditPass::OrphanDocuments), 1);
    assert!(vault.audit(&AuditScope::Local).await.unwrap());
    assert!(vault.documents("Boiler.Temp").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_queue_preserves_arrival_order() {
    let q: UpdateSerializationQueue<u32> =
        UpdateSerializationQueue::new(None, tagvault::telemetry::noop_event_listener());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for (i, delay) in [(1u32, 40u64), (2, 0), (3, 20), (4, 0)] {
        let seen = Arc::clone(&seen);
        handles.push(
            q.dispatch("Boiler.Temp", i, move |n| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                seen.lock().unwrap().push(n);
                if n == 2 {
                    return Err(StoreError::Validation("rejected".into()));
                }
                Ok(())
            })
            .unwrap(),
        );
    }
    let results: Vec<bool> = futures_results(handles).await;
    assert_eq!(results, vec![true, false, true, true]);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
}

async fn futures_results(
    handles: Vec<tokio::task::JoinHandle<Result<(), StoreError>>>,
) -> Vec<bool> {
    let mut out = Vec::new();
    for h in handles {
        out.push(h.await.unwrap().is_ok());
    }
    out
}

#[tokio::test]
async fn test_rejected_sample_is_reported() {
    #[derive(Debug, Default)]
    struct Rejections(Mutex<Vec<String>>);
    impl StoreEventListener for Rejections {
        fn on_event(&self, event: StoreEvent) {
            if let StoreEvent::SampleRejected { source, .. } = event {
                self.0.lock().unwrap().push(source);
            }
        }
    }

    let listener = Arc::new(Rejections::default());
    let vault = TagVault::open(StoreConfig {
        event_listener: listener.clone(),
        ..StoreConfig::ephemeral()
    })
    .await
    .unwrap();
    vault.sync_definitions(&catalog(), SyncMode::Local).await.unwrap();

    let err = vault
        .ingest(value("Boiler.Missing", "2022-01-05", json!(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(*listener.0.lock().unwrap(), vec!["Boiler.Missing".to_string()]);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 1000,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_monthly_writes_form_one_sorted_document(
        days in prop::collection::vec((1u32..=28, 0u32..24, -1000i64..1000), 1..60)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let doc = rt.block_on(async {
            let vault = vault_with_catalog().await;
            for (day, hour, v) in &days {
                let key = format!("2022-03-{:02}T{:02}:00:00Z", day, hour);
                vault.ingest(value("Boiler.Temp", &key, json!(v))).await.unwrap();
            }
            let mut docs = vault.documents("Boiler.Temp").await.unwrap();
            prop_assert_eq!(docs.len(), 1);
            Ok(docs.remove(0))
        })?;

        let unique: BTreeSet<(u32, u32)> = days.iter().map(|(d, h, _)| (*d, *h)).collect();
        prop_assert_eq!(doc.entries.len(), unique.len());
        let keys: Vec<&String> = doc.entries.iter().map(|e| &e.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);
        prop_assert_eq!(&doc.bucket_start, keys[0]);
        prop_assert_eq!(&doc.bucket_end, keys[keys.len() - 1]);

        // Last write per key wins.
        let (d, h, v) = days.last().unwrap();
        let key = format!("2022-03-{:02}T{:02}:00:00Z", d, h);
        prop_assert_eq!(&doc.entry(&key).unwrap().value, &json!(v));
    }
}

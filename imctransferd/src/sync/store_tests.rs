use super::*;
use std::io::Write;

async fn make_store() -> MetadataStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = MetadataStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn verified(remote_id: &str, path: &str, hash: &str) -> SyncRecord {
    let mut record = SyncRecord::new(remote_id, path, 100);
    record.content_hash = Some(hash.into());
    record.status = SyncStatus::Verified;
    record.integrity = Some(Integrity::HashVerified);
    record.local_path = Some(format!("/data/{path}"));
    record.verified_at = Some(1_700_000_000);
    record.created_at = Some("2023-11-14T22:13:20Z".into());
    record.created_by = Some("IMC Lab".into());
    record
}

#[tokio::test]
async fn upsert_and_get_roundtrip() {
    let store = make_store().await;
    let record = verified("A", "x/1.mcd", "h1");

    let committed = store.upsert(&record).await.unwrap();
    assert_eq!(committed.revision, 1);

    let fetched = store.get("A").await.unwrap().unwrap();
    assert_eq!(fetched, committed);
    assert!(store.get("B").await.unwrap().is_none());
}

#[tokio::test]
async fn update_bumps_revision() {
    let store = make_store().await;
    let mut record = store.upsert(&verified("A", "x/1.mcd", "h1")).await.unwrap();

    record.content_hash = Some("h2".into());
    let updated = store.upsert(&record).await.unwrap();

    assert_eq!(updated.revision, 2);
    let fetched = store.get("A").await.unwrap().unwrap();
    assert_eq!(fetched.content_hash.as_deref(), Some("h2"));
    assert_eq!(fetched.revision, 2);
}

#[tokio::test]
async fn stale_revision_is_a_conflict() {
    let store = make_store().await;
    let first = store.upsert(&verified("A", "x/1.mcd", "h1")).await.unwrap();

    let mut winner = first.clone();
    winner.status = SyncStatus::Downloading;
    store.upsert(&winner).await.unwrap();

    let mut loser = first;
    loser.status = SyncStatus::Failed;
    let err = store.upsert(&loser).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConcurrentWriteConflict { remote_id } if remote_id == "A"
    ));
    let fetched = store.get("A").await.unwrap().unwrap();
    assert_eq!(fetched.status, SyncStatus::Downloading);
}

#[tokio::test]
async fn double_insert_is_a_conflict() {
    let store = make_store().await;
    store.upsert(&SyncRecord::new("A", "a.mcd", 1)).await.unwrap();
    let err = store
        .upsert(&SyncRecord::new("A", "other.mcd", 2))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConcurrentWriteConflict { .. }));
}

#[tokio::test]
async fn concurrent_writers_on_one_id_only_one_wins() {
    let store = Arc::new(make_store().await);
    let base = store.upsert(&verified("A", "x/1.mcd", "h1")).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        let mut record = base.clone();
        record.last_error = Some(format!("writer {i}"));
        handles.push(tokio::spawn(async move { store.upsert(&record).await }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(StoreError::ConcurrentWriteConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 3);
}

#[tokio::test]
async fn list_all_is_ordered_by_remote_id() {
    let store = make_store().await;
    for id in ["C", "A", "B"] {
        store
            .upsert(&SyncRecord::new(id, format!("{id}.mcd"), 1))
            .await
            .unwrap();
    }
    let ids: Vec<_> = store
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.remote_id)
        .collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn mark_missing_keeps_the_rest_of_the_record() {
    let store = make_store().await;
    store.upsert(&verified("A", "x/1.mcd", "h1")).await.unwrap();

    store.mark_missing("A").await.unwrap();

    let record = store.get("A").await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Missing);
    assert_eq!(record.content_hash.as_deref(), Some("h1"));
    assert_eq!(record.local_path.as_deref(), Some("/data/x/1.mcd"));
    assert!(matches!(
        store.mark_missing("nope").await,
        Err(StoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn reset_failed_clears_attempts() {
    let store = make_store().await;
    let mut record = SyncRecord::new("A", "a.mcd", 1);
    record.status = SyncStatus::Failed;
    record.attempt_count = 5;
    record.last_error = Some("integrity mismatch".into());
    store.upsert(&record).await.unwrap();
    store.upsert(&verified("B", "b.mcd", "h")).await.unwrap();

    assert!(store.reset_failed("A").await.unwrap());
    assert!(!store.reset_failed("B").await.unwrap());
    assert!(matches!(
        store.reset_failed("Z").await,
        Err(StoreError::NotFound(_))
    ));

    let reset = store.get("A").await.unwrap().unwrap();
    assert_eq!(reset.status, SyncStatus::Pending);
    assert_eq!(reset.attempt_count, 0);
    assert!(reset.last_error.is_none());
}

#[tokio::test]
async fn counts_by_status() {
    let store = make_store().await;
    store.upsert(&verified("A", "a.mcd", "h")).await.unwrap();
    store.upsert(&verified("B", "b.mcd", "h")).await.unwrap();
    store.upsert(&SyncRecord::new("C", "c.mcd", 1)).await.unwrap();
    store.mark_missing("B").await.unwrap();

    let counts = store.status_counts().await.unwrap();
    assert_eq!(counts.verified, 1);
    assert_eq!(counts.missing, 1);
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total(), 3);
}

#[tokio::test]
async fn records_and_reads_last_pass() {
    let store = make_store().await;
    assert!(store.last_pass().await.unwrap().is_none());

    let mut pass = PassSummary {
        started_at: 10,
        finished_at: 20,
        phase: "done".into(),
        partial: false,
        fetched: 1,
        skipped: 2,
        failed: 0,
        missing: 0,
        renamed: 0,
        failures: Vec::new(),
    };
    store.record_pass(&pass).await.unwrap();
    pass.started_at = 30;
    pass.partial = true;
    pass.failures = vec!["B: integrity mismatch".into()];
    store.record_pass(&pass).await.unwrap();

    assert_eq!(store.last_pass().await.unwrap(), Some(pass));
}

#[tokio::test]
async fn unknown_status_is_corruption() {
    let store = make_store().await;
    sqlx::query("INSERT INTO sync_records (remote_id, path, status) VALUES ('X', 'x.mcd', 'bogus')")
        .execute(&store.pool)
        .await
        .unwrap();

    assert!(matches!(
        store.get("X").await,
        Err(StoreError::Corruption(_))
    ));
}

#[tokio::test]
async fn mistyped_column_is_corruption() {
    let store = make_store().await;
    sqlx::query(
        "INSERT INTO sync_records (remote_id, path, size, status) VALUES ('X', 'x.mcd', 'large', 'verified')",
    )
    .execute(&store.pool)
    .await
    .unwrap();

    let err = store.get("X").await.unwrap_err();
    assert!(matches!(err, StoreError::Corruption(_)), "got {err:?}");
    assert!(matches!(
        store.list_all().await,
        Err(StoreError::Corruption(_))
    ));
}

#[tokio::test]
async fn garbage_file_is_reported_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(&[0x5a; 4096]).unwrap();
    drop(file);

    let err = match MetadataStore::open(&path).await {
        Ok(_) => panic!("garbage database opened"),
        Err(err) => err,
    };
    assert!(matches!(err, StoreError::Corruption(_)), "got {err:?}");
}

#[tokio::test]
async fn open_creates_file_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("sync.db");

    let store = MetadataStore::open(&path).await.unwrap();
    store.upsert(&verified("A", "a.mcd", "h")).await.unwrap();
    drop(store);

    let reopened = MetadataStore::open(&path).await.unwrap();
    assert!(reopened.get("A").await.unwrap().is_some());
}

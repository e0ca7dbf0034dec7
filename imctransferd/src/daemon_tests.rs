use super::*;
use crate::sync::store::SyncStatus;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &[u8] = b"imc acquisition bytes";
const BODY_SHA1: &str = "9933ee6d3358a4253f4fc648d26b90e25e8898ba";

fn test_config(dir: &TempDir, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.remote.access_token = Some("test-token".into());
    config.remote.api_base_url = Some(server.uri());
    config.sync.root_output_dir = dir.path().join("raw");
    config.sync.staging_dir = dir.path().join("staging");
    config.sync.retry_base_delay_ms = 1;
    config.sync.retry_max_delay_ms = 2;
    config.daemon.database_path = Some(dir.path().join("db").join("sync.db"));
    config.daemon.metadata_file = dir.path().join("metadata").join("annotation.auto.csv");
    config
}

async fn mount_user(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "user",
            "id": "42",
            "login": "imc@example.org"
        })))
        .mount(server)
        .await;
}

async fn mount_tree(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "limit": 1000,
            "entries": [
                {
                    "type": "file",
                    "id": "1001",
                    "name": "20220314 tumor.mcd",
                    "size": BODY.len(),
                    "sha1": BODY_SHA1,
                    "content_modified_at": "2022-03-14T10:00:00Z",
                    "created_at": "2022-03-14T11:30:00-07:00",
                    "created_by": { "type": "user", "id": "42", "name": "IMC Lab" }
                },
                {
                    "type": "file",
                    "id": "1002",
                    "name": "notes.txt",
                    "size": 3,
                    "sha1": "a9993e364706816aba3e25717850c26c9cd0d89d"
                }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/1001/content"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BODY))
        .expect(1)
        .mount(server)
        .await;
}

#[test]
fn idle_clock_expires_without_progress() {
    let start = Instant::now();
    let mut clock = IdleClock::new(start, Some(Duration::from_secs(60)));

    assert!(!clock.expired(start + Duration::from_secs(59)));
    clock.observe(start + Duration::from_secs(30), 0);
    assert!(clock.expired(start + Duration::from_secs(60)));

    clock.observe(start + Duration::from_secs(50), 2);
    assert!(!clock.expired(start + Duration::from_secs(60)));
    assert!(clock.expired(start + Duration::from_secs(110)));
}

#[test]
fn idle_clock_without_timeout_never_expires() {
    let start = Instant::now();
    let clock = IdleClock::new(start, None);
    assert!(!clock.expired(start + Duration::from_secs(10 * 24 * 3600)));
    assert_eq!(
        clock.next_wait(start, Duration::from_secs(7200)),
        Duration::from_secs(7200)
    );
}

#[test]
fn next_wait_is_cut_short_by_idle_deadline() {
    let start = Instant::now();
    let clock = IdleClock::new(start, Some(Duration::from_secs(100)));
    assert_eq!(
        clock.next_wait(start + Duration::from_secs(70), Duration::from_secs(7200)),
        Duration::from_secs(30)
    );
    assert_eq!(
        clock.next_wait(start, Duration::from_secs(10)),
        Duration::from_secs(10)
    );
}

#[test]
fn status_lists_counts_and_last_pass() {
    let counts = StatusCounts {
        pending: 1,
        downloading: 0,
        verified: 3,
        failed: 1,
        missing: 0,
    };
    let pass = PassSummary {
        started_at: 0,
        finished_at: 60,
        phase: "executing".into(),
        partial: true,
        fetched: 2,
        skipped: 1,
        failed: 1,
        missing: 0,
        renamed: 0,
        failures: vec!["1003 (b.mcd): integrity mismatch".into()],
    };

    let text = render_status(&counts, Some(&pass));

    assert!(text.starts_with("records: 5 (verified 3, pending 1"));
    assert!(text.contains("1970-01-01T00:00:00Z -> 1970-01-01T00:01:00Z phase=executing (partial)"));
    assert!(text.contains("failure: 1003 (b.mcd): integrity mismatch"));
    assert!(render_status(&StatusCounts::default(), None).contains("last pass: never"));
}

#[tokio::test]
async fn once_mirrors_tree_and_writes_metadata() {
    let server = MockServer::start().await;
    mount_user(&server).await;
    mount_tree(&server).await;
    let dir = tempdir().unwrap();
    let config = test_config(&dir, &server);

    let daemon = DaemonRuntime::bootstrap(config).await.unwrap();
    let report = daemon.once(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.fetched, 1);
    assert!(!report.partial);
    assert_eq!(
        std::fs::read(dir.path().join("raw").join("20220314 tumor.mcd")).unwrap(),
        BODY
    );
    let record = daemon.store().get("1001").await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Verified);
    assert!(daemon.store().get("1002").await.unwrap().is_none());

    let mut table =
        csv::Reader::from_path(dir.path().join("metadata").join("annotation.auto.csv")).unwrap();
    let rows: Vec<csv::StringRecord> = table.records().map(|row| row.unwrap()).collect();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(&row[0], "20220314_tumor");
    assert_eq!(&row[1], "20220314 tumor.mcd");
    assert_eq!(&row[2], "IMC Lab");
    assert_eq!(&row[3], "2022-03-14T11:30:00-07:00");
    assert_eq!(&row[4], "https://api.box.com/2.0/files/1001");
    assert_eq!(&row[5], BODY_SHA1);
    assert_eq!(&row[6], "true");
    assert_eq!(&row[8], "20220314");

    let status = status(daemon.store()).await.unwrap();
    assert!(status.contains("verified 1"));
}

#[tokio::test]
async fn bootstrap_fails_fast_on_rejected_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();

    let err = match DaemonRuntime::bootstrap(test_config(&dir, &server)).await {
        Ok(_) => panic!("bootstrap must fail"),
        Err(err) => err,
    };

    assert!(format!("{err:#}").contains("failed to authenticate with Box"));
}

#[tokio::test]
async fn bootstrap_requires_token() {
    let server = MockServer::start().await;
    let dir = tempdir().unwrap();
    let mut config = test_config(&dir, &server);
    config.remote.access_token = None;

    assert!(DaemonRuntime::bootstrap(config).await.is_err());
}

#[tokio::test]
async fn run_returns_when_cancelled() {
    let server = MockServer::start().await;
    mount_user(&server).await;
    let dir = tempdir().unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(&dir, &server))
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), daemon.run(&cancel))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn run_stops_on_listing_auth_failure() {
    let server = MockServer::start().await;
    mount_user(&server).await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .respond_with(ResponseTemplate::new(401).set_body_string("expired"))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let daemon = DaemonRuntime::bootstrap(test_config(&dir, &server))
        .await
        .unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        daemon.run(&CancellationToken::new()),
    )
    .await
    .unwrap();

    assert!(result.is_err());
}

#[tokio::test]
async fn reset_reports_unknown_and_non_failed_records() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    let store = open_store(&test_config(&dir, &server)).await.unwrap();

    assert!(reset(&store, "nope").await.is_err());

    let mut record = crate::sync::store::SyncRecord::new("7", "a.mcd", 1);
    record.status = SyncStatus::Failed;
    record.attempt_count = 5;
    store.upsert(&record).await.unwrap();

    assert!(reset(&store, "7").await.unwrap());
    assert!(!reset(&store, "7").await.unwrap());
    let record = store.get("7").await.unwrap().unwrap();
    assert_eq!(record.status, SyncStatus::Pending);
    assert_eq!(record.attempt_count, 0);
}

#[tokio::test]
async fn report_command_rewrites_metadata_file() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    let config = test_config(&dir, &server);
    let store = open_store(&config).await.unwrap();
    let mut record = crate::sync::store::SyncRecord::new("9", "runs/20230101 lung.mcd", 4);
    record.status = SyncStatus::Verified;
    store.upsert(&record).await.unwrap();

    let written = write_metadata(&store, &config.daemon.metadata_file)
        .await
        .unwrap();

    assert_eq!(written, 1);
    assert!(config.daemon.metadata_file.exists());
}

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chargelog_adapters::{FixtureSource, SnapshotSource, SourceError};
use chargelog_storage::{FetchError, Store};
use chargelog_sync::{IngestConfig, IngestError, IngestIssue, IngestPipeline};
use serde_json::{json, Value as JsonValue};
use tempfile::{tempdir, TempDir};

/// Hands out one scripted poll per `fetch_snapshots` call.
struct ScriptedSource {
    polls: Mutex<Vec<Vec<JsonValue>>>,
}

impl ScriptedSource {
    fn new(mut polls: Vec<Vec<JsonValue>>) -> Self {
        polls.reverse();
        Self {
            polls: Mutex::new(polls),
        }
    }
}

#[async_trait]
impl SnapshotSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_snapshots(&self) -> Result<Vec<JsonValue>, SourceError> {
        let next = self.polls.lock().expect("poll script lock").pop();
        Ok(next.unwrap_or_default())
    }
}

struct UnreachableSource;

#[async_trait]
impl SnapshotSource for UnreachableSource {
    fn source_id(&self) -> &'static str {
        "unreachable"
    }

    async fn fetch_snapshots(&self) -> Result<Vec<JsonValue>, SourceError> {
        Err(SourceError::Fetch(FetchError::HttpStatus {
            status: 503,
            host: "api.openchargemap.io".to_string(),
        }))
    }
}

fn station(status: &str, operational: bool) -> JsonValue {
    json!({
        "ID": 42,
        "AddressInfo": { "Title": "Parkhaus Marktplatz", "Latitude": 52.52, "Longitude": 13.405 },
        "OperatorInfo": { "Title": "Stadtwerke Berlin" },
        "StatusType": { "Title": status, "IsOperational": operational },
        "NumberOfPoints": 2,
        "Connections": [{ "PowerKW": 22.0 }, { "PowerKW": 50.0 }],
        "UserComments": [
            { "ID": 99, "CommentType": { "Title": "General Comment" }, "Comment": "Works fine" }
        ]
    })
}

fn workspace(dir: &TempDir) -> (PathBuf, IngestConfig) {
    let db = dir.path().join("data").join("ev.db");
    let config = IngestConfig {
        database_url: format!("sqlite://{}", db.display()),
        ..IngestConfig::default()
    };
    (db, config)
}

fn pipeline(config: IngestConfig, polls: Vec<Vec<JsonValue>>) -> IngestPipeline {
    IngestPipeline::with_source(config, Box::new(ScriptedSource::new(polls)))
}

#[tokio::test]
async fn status_history_records_only_changes_across_polls() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let pipeline = pipeline(
        config,
        vec![
            vec![station("Operational", true)],
            vec![station("Operational", true)],
            vec![station("Faulted", false)],
        ],
    );

    let first = pipeline.run_once().await.expect("poll 1");
    assert_eq!(first.run.counts.status_events_written, 1);
    let second = pipeline.run_once().await.expect("poll 2");
    assert_eq!(second.run.counts.status_events_written, 0);
    assert_eq!(second.run.counts.status_unchanged, 1);
    pipeline.run_once().await.expect("poll 3");

    let store = Store::open(&db).await.expect("reopen");
    let counts = store.counts().await.expect("counts");
    assert_eq!(counts.stations, 1);
    assert_eq!(counts.status_events, 2);

    let history = store.status_history(42).await.expect("history");
    assert_eq!(history[0].tuple.status.as_deref(), Some("Operational"));
    assert_eq!(history[1].tuple.status.as_deref(), Some("Faulted"));
    assert_eq!(history[1].tuple.is_operational, Some(false));
}

#[tokio::test]
async fn repeated_comment_is_stored_once() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let pipeline = pipeline(
        config,
        vec![
            vec![station("Operational", true)],
            vec![station("Operational", true)],
        ],
    );

    let first = pipeline.run_once().await.expect("poll 1");
    let second = pipeline.run_once().await.expect("poll 2");
    assert_eq!(first.run.counts.comments_inserted, 1);
    assert_eq!(second.run.counts.comments_inserted, 0);
    assert_eq!(second.run.counts.comments_already_recorded, 1);

    let store = Store::open(&db).await.expect("reopen");
    let comments = store.comment_events(42).await.expect("comments");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].comment_id, "99");
}

#[tokio::test]
async fn record_without_id_does_not_disturb_neighbours() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let mut other = station("Operational", true);
    other["ID"] = json!(43);
    let pipeline = pipeline(
        config,
        vec![vec![
            station("Operational", true),
            json!({ "StatusType": { "Title": "Operational" } }),
            other,
        ]],
    );

    let summary = pipeline.run_once().await.expect("poll");
    assert_eq!(summary.run.counts.records_seen, 3);
    assert_eq!(summary.run.counts.records_ingested, 2);
    assert_eq!(summary.run.counts.records_skipped, 1);
    assert!(matches!(
        summary.issues.as_slice(),
        [IngestIssue::MissingStationId { index: 1 }]
    ));

    let store = Store::open(&db).await.expect("reopen");
    assert!(store.facility(42).await.expect("facility").is_some());
    assert!(store.facility(43).await.expect("facility").is_some());
    let counts = store.counts().await.expect("counts");
    assert_eq!(counts.stations, 2);
    assert_eq!(counts.status_events, 2);
}

#[tokio::test]
async fn facility_attributes_follow_the_latest_snapshot() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let mut renamed = station("Operational", true);
    renamed["AddressInfo"] = json!({ "Title": "Parkhaus Mitte" });
    renamed["OperatorInfo"] = JsonValue::Null;
    let pipeline = pipeline(config, vec![vec![station("Operational", true)], vec![renamed]]);

    pipeline.run_once().await.expect("poll 1");
    pipeline.run_once().await.expect("poll 2");

    let store = Store::open(&db).await.expect("reopen");
    let facility = store.facility(42).await.expect("facility").expect("row");
    assert_eq!(facility.title.as_deref(), Some("Parkhaus Mitte"));
    assert_eq!(facility.operator, None);
    assert_eq!(facility.lat, None);
    assert_eq!(facility.max_power_kw, Some(50.0));
    assert_eq!(store.status_history(42).await.expect("history").len(), 1);
}

#[tokio::test]
async fn transport_failure_leaves_no_store_behind() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let pipeline = IngestPipeline::with_source(config, Box::new(UnreachableSource));

    let err = pipeline.run_once().await.expect_err("fetch fails");
    assert!(matches!(
        err,
        IngestError::Transport {
            source_id: "unreachable",
            ..
        }
    ));
    assert!(!db.exists());
}

#[tokio::test]
async fn empty_poll_is_reported_as_no_data() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let pipeline = pipeline(config, vec![vec![]]);

    let err = pipeline.run_once().await.expect_err("empty poll");
    assert!(matches!(err, IngestError::NoData { source_id: "scripted" }));
    assert!(!db.exists());
}

#[tokio::test]
async fn sample_fixture_ingests_end_to_end() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);
    let fixture = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/openchargemap/sample_de.json");
    let pipeline = IngestPipeline::with_source(config, Box::new(FixtureSource::new(fixture)));

    let summary = pipeline.run_once().await.expect("fixture poll");
    let counts = summary.run.counts;
    assert_eq!(counts.records_ingested, 2);
    assert_eq!(counts.records_skipped, 1);
    assert_eq!(counts.comments_inserted, 2);
    assert_eq!(counts.comments_skipped, 1);

    let store = Store::open(&db).await.expect("reopen");
    let faulty = store.status_history(43).await.expect("history");
    assert_eq!(faulty.len(), 1);
    assert_eq!(faulty[0].tuple.status.as_deref(), Some("Not Operational"));
    assert_eq!(
        faulty[0].tuple.comment_text.as_deref(),
        Some("Display dark, card reader not responding.")
    );
    let comments = store.comment_events(43).await.expect("comments");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].comment_id, "120");

    let facility = store.facility(42).await.expect("facility").expect("row");
    assert_eq!(facility.max_power_kw, Some(50.0));
    assert_eq!(facility.num_points, Some(2));
}

#[tokio::test]
async fn scheduler_is_only_built_when_enabled() {
    let dir = tempdir().expect("tempdir");
    let (_db, config) = workspace(&dir);
    let disabled = std::sync::Arc::new(pipeline(config.clone(), vec![]));
    assert!(disabled
        .maybe_build_scheduler()
        .await
        .expect("disabled scheduler")
        .is_none());

    let enabled = std::sync::Arc::new(pipeline(
        IngestConfig {
            scheduler_enabled: true,
            ..config
        },
        vec![],
    ));
    assert!(enabled
        .maybe_build_scheduler()
        .await
        .expect("enabled scheduler")
        .is_some());
}

#[tokio::test]
async fn station_report_never_creates_a_database() {
    let dir = tempdir().expect("tempdir");
    let (db, config) = workspace(&dir);

    let err = chargelog_sync::station_report(&config, 42)
        .await
        .expect_err("no database yet");
    assert!(err.to_string().contains("no history database"));
    assert!(!db.exists());
    assert!(!db.parent().expect("data dir").exists());
}

#[tokio::test]
async fn station_report_reads_back_ingested_history() {
    let dir = tempdir().expect("tempdir");
    let (_db, config) = workspace(&dir);
    let pipeline = pipeline(
        config.clone(),
        vec![vec![station("Operational", true)], vec![station("Faulted", false)]],
    );
    pipeline.run_once().await.expect("poll 1");
    pipeline.run_once().await.expect("poll 2");

    let report = chargelog_sync::station_report(&config, 42)
        .await
        .expect("report")
        .expect("station 42");
    assert_eq!(report.facility.title.as_deref(), Some("Parkhaus Marktplatz"));
    assert_eq!(report.status_history.len(), 2);
    assert_eq!(report.comments.len(), 1);

    assert!(chargelog_sync::station_report(&config, 7)
        .await
        .expect("report")
        .is_none());
}

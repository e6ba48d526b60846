//! End-to-end pipeline tests over the in-memory store, catalog, fetcher
//! and log sink.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use stacforge::catalog::{CatalogApi, MemoryCatalog};
use stacforge::config::ForgeConfig;
use stacforge::engine::MemoryFetcher;
use stacforge::logsink::{LogLevel, LogSink, MemorySink};
use stacforge::orchestrator::{parse_run_info, Orchestrator, RunStatus, SceneOutcome};
use stacforge::source::SourceManager;
use stacforge::storage::{MemoryStore, ObjectStore};
use stacforge::OrchestrationError;

const CONTAINER: &str = "https://acct.blob.core.windows.net/data";
const TEMPLATE_URL: &str = "https://acct.blob.core.windows.net/templates/item.json";

const ITEM_TEMPLATE: &str = r#"{
  "type": "Feature",
  "stac_version": "1.0.0",
  "id": "{{ scene_info | split(pat="/") | last | regex_sub(pattern="\\.tif$", repl="") }}",
  "geometry": {"type": "Point", "coordinates": [15.0, 37.0]},
  "bbox": [15.0, 37.0, 15.0, 37.0],
  "properties": {"datetime": "2024-06-01T00:00:00Z"},
  "links": [],
  "assets": {"data": {"href": "{{ scene_info }}", "type": "image/tiff; application=geotiff"}}
}"#;

/// Same shape but without a datetime, so every rendered item fails the
/// validation gate.
const INVALID_TEMPLATE: &str = r#"{
  "type": "Feature",
  "id": "{{ scene_info | split(pat="/") | last }}",
  "geometry": {"type": "Point", "coordinates": [15.0, 37.0]},
  "bbox": [15.0, 37.0, 15.0, 37.0],
  "properties": {},
  "links": [],
  "assets": {"data": {"href": "{{ scene_info }}"}}
}"#;

struct Fixture {
    orchestrator: Orchestrator,
    catalog: Arc<MemoryCatalog>,
    sink: Arc<MemorySink>,
    store: Arc<MemoryStore>,
}

fn fixture(template: &str) -> Fixture {
    let config = ForgeConfig::default()
        .with_retry(2, Duration::from_millis(1))
        .with_poll_interval(Duration::from_millis(1));
    let catalog = Arc::new(MemoryCatalog::new().with_collection("c1"));
    let sources = Arc::new(SourceManager::new(
        Arc::clone(&catalog) as Arc<dyn CatalogApi>,
        config.source_refresh_margin,
        config.sas_lifetime,
    ));
    let sink = Arc::new(MemorySink::new());
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(TEMPLATE_URL, template.as_bytes().to_vec());

    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&catalog) as Arc<dyn CatalogApi>,
        sources,
        Arc::clone(&sink) as Arc<dyn LogSink>,
        fetcher,
    );
    Fixture {
        orchestrator,
        catalog,
        sink,
        store: Arc::new(MemoryStore::new(CONTAINER)),
    }
}

fn payload() -> stacforge::RunInfo {
    parse_run_info(&json!({
        "crawlingType": "file",
        "sourceStorageAccountName": "acct",
        "sourceContainerName": "data",
        "pattern": "*.tif",
        "templateUrl": TEMPLATE_URL,
        "targetCollectionId": "c1"
    }))
    .unwrap()
}

fn not_cancelled() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive for the duration of the test process.
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn every_scene_gets_exactly_one_outcome() {
    let f = fixture(ITEM_TEMPLATE);
    for name in ["a.tif", "a.tfw", "b.tif", "sub/c.tif"] {
        f.store.insert(name, b"x".to_vec());
    }

    let report = f
        .orchestrator
        .run("run-1", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    // The glob keeps the three .tif blobs; the sidecar .tfw is not a scene.
    assert_eq!(report.total, 3);
    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report
        .outcomes
        .iter()
        .all(|(_, o)| *o == SceneOutcome::Succeeded));
    let submitted = f.catalog.submitted_items("c1");
    assert_eq!(submitted.len(), 3);
    assert!(submitted.iter().any(|i| i.id == "c"));
}

#[tokio::test]
async fn partial_failure_fails_the_run_with_full_tally() {
    let f = fixture(ITEM_TEMPLATE);
    for i in 0..10 {
        f.store.insert(&format!("scene{i}.tif"), b"x".to_vec());
    }
    // Three ids collide with existing items; the catalog rejects them
    // with a client error that is never retried.
    {
        let mut reject = f.catalog.reject_ids.lock().unwrap();
        reject.push("scene2".to_string());
        reject.push("scene5".to_string());
        reject.push("scene8".to_string());
    }

    let report = f
        .orchestrator
        .run("run-2", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.total, 10);
    assert_eq!(report.succeeded, 7);
    assert_eq!(report.failed, 3);
    for (scene, outcome) in &report.outcomes {
        let should_fail = scene.contains("scene2") || scene.contains("scene5") || scene.contains("scene8");
        match outcome {
            SceneOutcome::Failed(reason) => {
                assert!(should_fail, "{scene} failed unexpectedly: {reason}");
                assert!(reason.contains("already exists"));
            }
            SceneOutcome::Succeeded => assert!(!should_fail, "{scene} should have failed"),
            SceneOutcome::Pending => panic!("{scene} left pending"),
        }
    }

    // The log table records one terminal outcome per scene.
    let records = f.sink.records_for("run-2");
    let outcomes = records
        .iter()
        .filter(|r| {
            r.scene.is_some()
                && (r.message == "scene succeeded" || r.level == LogLevel::Error)
        })
        .count();
    assert_eq!(outcomes, 10);
}

#[tokio::test]
async fn invalid_items_never_reach_the_catalog() {
    let f = fixture(INVALID_TEMPLATE);
    f.store.insert("a.tif", b"x".to_vec());
    f.store.insert("b.tif", b"x".to_vec());

    let report = f
        .orchestrator
        .run("run-3", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed, 2);
    assert!(f.catalog.submitted_items("c1").is_empty());
    for (_, outcome) in &report.outcomes {
        match outcome {
            SceneOutcome::Failed(reason) => assert!(reason.contains("datetime")),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn empty_crawl_succeeds_vacuously() {
    let f = fixture(ITEM_TEMPLATE);

    let report = f
        .orchestrator
        .run("run-4", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.total, 0);
    // No scenes means no credential is needed.
    assert_eq!(f.catalog.source_count(), 0);
}

#[tokio::test]
async fn consecutive_runs_reuse_the_ingestion_source() {
    let f = fixture(ITEM_TEMPLATE);
    f.store.insert("a.tif", b"x".to_vec());

    f.orchestrator
        .run("run-5a", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();
    f.orchestrator
        .run("run-5b", &payload(), Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    // First run registers the container; the second finds a credential
    // with plenty of lifetime left and touches nothing.
    assert_eq!(f.catalog.source_count(), 1);
    assert_eq!(f.catalog.create_count(), 1);
    assert_eq!(f.catalog.delete_count(), 0);
}

#[tokio::test]
async fn missing_template_is_fatal() {
    let f = fixture(ITEM_TEMPLATE);
    f.store.insert("a.tif", b"x".to_vec());
    let mut info = payload();
    info.template_url = "https://acct.blob.core.windows.net/templates/missing.json".to_string();

    let err = f
        .orchestrator
        .run("run-6", &info, Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Template(_)));
    assert!(f.catalog.submitted_items("c1").is_empty());
}

#[tokio::test]
async fn missing_collection_is_fatal() {
    let f = fixture(ITEM_TEMPLATE);
    f.store.insert("a.tif", b"x".to_vec());
    let mut info = payload();
    info.target_collection_id = "nope".to_string();

    let err = f
        .orchestrator
        .run("run-7", &info, Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Catalog(_)));
}

#[tokio::test]
async fn cancellation_fails_undispatched_scenes() {
    let config = ForgeConfig::default()
        .with_retry(1, Duration::from_millis(1))
        .with_poll_interval(Duration::from_millis(1))
        .with_max_concurrent_scenes(1);
    let catalog = Arc::new(MemoryCatalog::new().with_collection("c1"));
    let sources = Arc::new(SourceManager::new(
        Arc::clone(&catalog) as Arc<dyn CatalogApi>,
        config.source_refresh_margin,
        config.sas_lifetime,
    ));
    let sink = Arc::new(MemorySink::new());
    let fetcher = Arc::new(MemoryFetcher::new());
    fetcher.insert(TEMPLATE_URL, ITEM_TEMPLATE.as_bytes().to_vec());
    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&catalog) as Arc<dyn CatalogApi>,
        sources,
        sink,
        fetcher,
    );
    let store = Arc::new(MemoryStore::new(CONTAINER));
    for i in 0..20 {
        store.insert(&format!("scene{i}.tif"), b"x".to_vec());
    }

    // Cancel before the run starts: every scene is failed without being
    // submitted.
    let (tx, rx) = watch::channel(true);
    let report = orchestrator
        .run("run-8", &payload(), Arc::clone(&store) as Arc<dyn ObjectStore>, rx)
        .await
        .unwrap();
    drop(tx);

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.total, 20);
    assert_eq!(report.succeeded, 0);
    assert!(catalog.submitted_items("c1").is_empty());
}

#[tokio::test]
async fn index_crawl_processes_records() {
    let f = fixture(ITEM_TEMPLATE);
    f.store.insert(
        "index.txt",
        b"# scene list\nhttps://acct.blob.core.windows.net/data/a.tif\nhttps://acct.blob.core.windows.net/data/b.tif\n"
            .to_vec(),
    );
    let info = parse_run_info(&json!({
        "crawlingType": "index",
        "sourceStorageAccountName": "acct",
        "sourceContainerName": "data",
        "indexFilePath": "index.txt",
        "templateUrl": TEMPLATE_URL,
        "targetCollectionId": "c1"
    }))
    .unwrap();

    let report = f
        .orchestrator
        .run("run-9", &info, Arc::clone(&f.store) as Arc<dyn ObjectStore>, not_cancelled())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.total, 2);
    let ids: Vec<_> = f
        .catalog
        .submitted_items("c1")
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert!(ids.contains(&"a".to_string()));
    assert!(ids.contains(&"b".to_string()));
}

//! HTTP trigger surface.
//!
//! A thin axum router over the orchestrator: start a run, query its
//! status, terminate it. Runs execute on spawned tasks; the registry
//! keeps one entry per run with its cancellation handle and latest
//! state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::orchestrator::{parse_run_info, Orchestrator, RunReport, RunStatus};
use crate::retry::RetryPolicy;
use crate::storage::ObjectStore;

/// Produces the object store a run crawls, from the payload's account
/// and container names.
pub trait StoreFactory: Send + Sync {
    fn store_for(&self, account: &str, container: &str) -> Arc<dyn ObjectStore>;
}

/// Builds Azure blob stores from the configured endpoint suffix,
/// account key and retry policy.
pub struct AzureStoreFactory {
    endpoint_suffix: String,
    account_key: Option<String>,
    retry: RetryPolicy,
}

impl AzureStoreFactory {
    pub fn new(
        endpoint_suffix: impl Into<String>,
        account_key: Option<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            endpoint_suffix: endpoint_suffix.into(),
            account_key,
            retry,
        }
    }
}

impl StoreFactory for AzureStoreFactory {
    fn store_for(&self, account: &str, container: &str) -> Arc<dyn ObjectStore> {
        let mut store = crate::storage::AzureBlobStore::new(
            account,
            container,
            &self.endpoint_suffix,
            self.retry,
        );
        if let Some(key) = &self.account_key {
            store = store.with_account_key(key);
        }
        Arc::new(store)
    }
}

/// Latest observable state of one run.
struct RunState {
    status: RunStatus,
    error: Option<String>,
    report: Option<RunReport>,
}

struct RunEntry {
    cancel: watch::Sender<bool>,
    state: Arc<Mutex<RunState>>,
}

/// All runs started by this process, keyed by run id.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<String, RunEntry>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<RunRegistry>,
    stores: Arc<dyn StoreFactory>,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        registry: Arc<RunRegistry>,
        stores: Arc<dyn StoreFactory>,
    ) -> Self {
        Self {
            orchestrator,
            registry,
            stores,
        }
    }
}

/// Builds the trigger router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/orchestrations/geotemplate-bulk-transform",
            post(start_run),
        )
        .route("/orchestrations/:id", get(run_status))
        .route("/orchestrations/:id/terminate", post(terminate_run))
        .with_state(state)
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// POST /orchestrations/geotemplate-bulk-transform
///
/// Validates the payload, registers the run and spawns it. Responds 202
/// with the run id and management URIs before the run finishes.
async fn start_run(State(app): State<AppState>, body: Result<Json<Value>, axum::extract::rejection::JsonRejection>) -> Response {
    let Json(payload) = match body {
        Ok(body) => body,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };
    let info = match parse_run_info(&payload) {
        Ok(info) => info,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let run_id = Uuid::new_v4().to_string();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let state = Arc::new(Mutex::new(RunState {
        status: RunStatus::Running,
        error: None,
        report: None,
    }));
    app.registry.runs.lock().expect("registry poisoned").insert(
        run_id.clone(),
        RunEntry {
            cancel: cancel_tx,
            state: Arc::clone(&state),
        },
    );

    let store = app
        .stores
        .store_for(&info.source_storage_account_name, &info.source_container_name);
    let orchestrator = Arc::clone(&app.orchestrator);
    let task_run_id = run_id.clone();
    tokio::spawn(async move {
        let outcome = orchestrator
            .run(&task_run_id, &info, store, cancel_rx)
            .await;
        let mut state = state.lock().expect("run state poisoned");
        match outcome {
            Ok(report) => {
                info!(run_id = %task_run_id, status = ?report.status, "run finished");
                state.status = report.status;
                state.report = Some(report);
            }
            Err(e) => {
                error!(run_id = %task_run_id, error = %e, "run failed during setup");
                state.status = RunStatus::Failed;
                state.error = Some(e.to_string());
            }
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({
            "id": run_id,
            "statusQueryGetUri": format!("/orchestrations/{run_id}"),
            "terminatePostUri": format!("/orchestrations/{run_id}/terminate"),
        })),
    )
        .into_response()
}

/// GET /orchestrations/{id}?showDetail=true
async fn run_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let runs = app.registry.runs.lock().expect("registry poisoned");
    let Some(entry) = runs.get(&id) else {
        return error_body(StatusCode::NOT_FOUND, format!("unknown run '{id}'"));
    };
    let state = entry.state.lock().expect("run state poisoned");

    let mut body = json!({ "id": id, "status": state.status });
    if let Some(error) = &state.error {
        body["error"] = json!(error);
    }
    if let Some(report) = &state.report {
        body["total"] = json!(report.total);
        body["succeeded"] = json!(report.succeeded);
        body["failed"] = json!(report.failed);
        let show_detail = params
            .get("showDetail")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if show_detail {
            body["scenes"] = report
                .outcomes
                .iter()
                .map(|(scene, outcome)| {
                    let mut entry = json!({ "scene": scene });
                    match outcome {
                        crate::orchestrator::SceneOutcome::Succeeded => {
                            entry["state"] = json!("Succeeded")
                        }
                        crate::orchestrator::SceneOutcome::Failed(reason) => {
                            entry["state"] = json!("Failed");
                            entry["reason"] = json!(reason);
                        }
                        crate::orchestrator::SceneOutcome::Pending => {
                            entry["state"] = json!("Pending")
                        }
                    }
                    entry
                })
                .collect();
        }
    }
    Json(body).into_response()
}

/// POST /orchestrations/{id}/terminate
///
/// Flips the run's cancellation flag. Undispatched scenes are failed;
/// in-flight scenes complete.
async fn terminate_run(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let runs = app.registry.runs.lock().expect("registry poisoned");
    let Some(entry) = runs.get(&id) else {
        return error_body(StatusCode::NOT_FOUND, format!("unknown run '{id}'"));
    };
    // Send fails only when the run already dropped its receiver.
    let _ = entry.cancel.send(true);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "terminating": true })),
    )
        .into_response()
}

/// Binds and serves the trigger surface until the process stops.
pub async fn serve(addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "trigger surface listening");
    axum::serve(listener, router(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::config::ForgeConfig;
    use crate::engine::MemoryFetcher;
    use crate::logsink::MemorySink;
    use crate::source::SourceManager;
    use crate::storage::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    const CONTAINER: &str = "https://acct.blob.core.windows.net/data";
    const TEMPLATE_URL: &str = "https://acct.blob.core.windows.net/templates/item.json";

    const TEMPLATE: &str = r#"{
  "type": "Feature",
  "id": "{{ scene_info | split(pat="/") | last | regex_sub(pattern="\\.tif$", repl="") }}",
  "geometry": {"type": "Point", "coordinates": [15.0, 37.0]},
  "bbox": [15.0, 37.0, 15.0, 37.0],
  "properties": {"datetime": "2024-06-01T00:00:00Z"},
  "links": [],
  "assets": {"data": {"href": "{{ scene_info }}"}}
}"#;

    struct MemoryStoreFactory {
        store: Arc<MemoryStore>,
    }

    impl StoreFactory for MemoryStoreFactory {
        fn store_for(&self, _account: &str, _container: &str) -> Arc<dyn ObjectStore> {
            Arc::clone(&self.store) as Arc<dyn ObjectStore>
        }
    }

    fn test_app() -> (AppState, Arc<MemoryCatalog>) {
        let config = ForgeConfig::default()
            .with_retry(1, Duration::from_millis(1))
            .with_poll_interval(Duration::from_millis(1));
        let catalog = Arc::new(MemoryCatalog::new().with_collection("c1"));
        let sources = Arc::new(SourceManager::new(
            Arc::clone(&catalog) as Arc<dyn crate::catalog::CatalogApi>,
            config.source_refresh_margin,
            config.sas_lifetime,
        ));
        let sink = Arc::new(MemorySink::new());
        let fetcher = Arc::new(MemoryFetcher::new());
        fetcher.insert(TEMPLATE_URL, TEMPLATE.as_bytes().to_vec());

        let store = Arc::new(MemoryStore::new(CONTAINER));
        store.insert("a.tif", b"x".to_vec());
        store.insert("b.tif", b"x".to_vec());

        let orchestrator = Arc::new(Orchestrator::new(
            config,
            Arc::clone(&catalog) as Arc<dyn crate::catalog::CatalogApi>,
            sources,
            sink,
            fetcher,
        ));
        let state = AppState::new(
            orchestrator,
            Arc::new(RunRegistry::new()),
            Arc::new(MemoryStoreFactory { store }),
        );
        (state, catalog)
    }

    fn trigger_payload() -> Value {
        json!({
            "crawlingType": "file",
            "sourceStorageAccountName": "acct",
            "sourceContainerName": "data",
            "pattern": "*.tif",
            "templateUrl": TEMPLATE_URL,
            "targetCollectionId": "c1"
        })
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn azure_factory_builds_stores_from_payload_names() {
        let factory = AzureStoreFactory::new(
            "blob.core.windows.net",
            Some("a2V5".to_string()),
            RetryPolicy::new(3, Duration::from_millis(1)),
        );
        let store = factory.store_for("acct", "data");
        assert_eq!(
            store.container_url(),
            "https://acct.blob.core.windows.net/data"
        );
    }

    #[tokio::test]
    async fn trigger_accepts_and_completes() {
        let (state, catalog) = test_app();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/orchestrations/geotemplate-bulk-transform")
                    .header("content-type", "application/json")
                    .body(Body::from(trigger_payload().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let run_id = body["id"].as_str().unwrap().to_string();
        assert_eq!(
            body["statusQueryGetUri"],
            json!(format!("/orchestrations/{run_id}"))
        );

        // Poll until the spawned run settles.
        let mut status = json!(null);
        for _ in 0..100 {
            let response = app
                .clone()
                .oneshot(
                    Request::get(format!("/orchestrations/{run_id}?showDetail=true"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            status = body_json(response).await;
            if status["status"] != json!("Running") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status["status"], json!("Succeeded"));
        assert_eq!(status["total"], json!(2));
        assert_eq!(status["succeeded"], json!(2));
        assert_eq!(status["scenes"].as_array().unwrap().len(), 2);
        assert_eq!(catalog.submitted_items("c1").len(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let (state, _) = test_app();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/orchestrations/geotemplate-bulk-transform")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"crawlingType\": \"file\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(
                Request::post("/orchestrations/geotemplate-bulk-transform")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let (state, _) = test_app();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::get("/orchestrations/no-such-run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/orchestrations/no-such-run/terminate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminate_flips_cancellation() {
        let (state, _) = test_app();
        let app = router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/orchestrations/geotemplate-bulk-transform")
                    .header("content-type", "application/json")
                    .body(Body::from(trigger_payload().to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let run_id = body["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::post(format!("/orchestrations/{run_id}/terminate"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let runs = state.registry.runs.lock().unwrap();
        assert!(*runs.get(&run_id).unwrap().cancel.borrow());
    }
}

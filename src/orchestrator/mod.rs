//! The orchestrator: drives one run from crawl to per-scene submission.
//!
//! Fatal setup work happens before any scene is touched: payload
//! validation, template fetch and compile, the crawl itself, the target
//! collection check, and minting of the ingestion credential. Scene
//! processing then fans out over a semaphore-bounded worker pool; every
//! scene gets exactly one outcome in the final report regardless of how
//! its processing ends.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::catalog::{CatalogApi, OperationStatus};
use crate::config::{ConflictMode, ForgeConfig};
use crate::crawler::{self, CrawlDescriptor, Scene};
use crate::engine::{BlobFetcher, Environment};
use crate::error::{CatalogError, OrchestrationError, RenderError};
use crate::logsink::{LogSink, RunLogger};
use crate::retry::RetryPolicy;
use crate::source::SourceManager;
use crate::storage::ObjectStore;

pub const ORCHESTRATION_NAME: &str = "geotemplate_bulk_transform";

const TEMPLATE_NAME: &str = "geotemplate";
const CRAWL_ACTIVITY: &str = "crawl_scenes";
const TRANSFORM_ACTIVITY: &str = "geotemplate_transform";

/// Crawling policy selector in the trigger payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlingType {
    File,
    Directory,
    Index,
}

fn default_ignore_marker() -> Option<String> {
    Some("#".to_string())
}

/// Trigger payload of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub crawling_type: CrawlingType,
    pub source_storage_account_name: String,
    pub source_container_name: String,
    pub template_url: String,
    pub target_collection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file_path: Option<String>,
    #[serde(default)]
    pub index_file_is_ndjson: bool,
    #[serde(default = "default_ignore_marker")]
    pub index_file_ignore_lines_starting_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starting_directory: Option<String>,
    /// Accepted for compatibility; the shape validation gate always
    /// runs before submission.
    #[serde(default)]
    pub validate: bool,
}

impl RunInfo {
    /// Rejects contradictory crawling options.
    pub fn check_crawling_options(&self) -> Result<(), OrchestrationError> {
        match self.crawling_type {
            CrawlingType::Index => {
                if self.index_file_path.is_none() {
                    return Err(OrchestrationError::InvalidPayload(
                        "indexFilePath is required for index crawling".to_string(),
                    ));
                }
                if self.pattern.is_some() {
                    return Err(OrchestrationError::InvalidPayload(
                        "pattern must not be provided for index crawling".to_string(),
                    ));
                }
            }
            CrawlingType::File | CrawlingType::Directory => {
                if self.index_file_path.is_some() {
                    return Err(OrchestrationError::InvalidPayload(
                        "indexFilePath must not be provided for non-index crawling".to_string(),
                    ));
                }
            }
        }
        if self.source_storage_account_name.is_empty()
            || self.source_container_name.is_empty()
            || self.template_url.is_empty()
            || self.target_collection_id.is_empty()
        {
            return Err(OrchestrationError::InvalidPayload(
                "storage account, container, template URL and collection id are required"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn descriptor(&self) -> CrawlDescriptor {
        match self.crawling_type {
            CrawlingType::File => CrawlDescriptor::File {
                prefix: self.starting_directory.clone(),
                pattern: self.pattern.clone(),
            },
            CrawlingType::Directory => CrawlDescriptor::Directory {
                prefix: self.starting_directory.clone(),
                pattern: self.pattern.clone(),
            },
            CrawlingType::Index => CrawlDescriptor::Index {
                path: self.index_file_path.clone().unwrap_or_default(),
                ndjson: self.index_file_is_ndjson,
                ignore_lines_starting_with: self
                    .index_file_ignore_lines_starting_with
                    .clone(),
            },
        }
    }
}

/// Final state of one scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum SceneOutcome {
    Pending,
    Succeeded,
    Failed(String),
}

/// Aggregate state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// Per-scene outcomes plus the aggregate tally of one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<(String, SceneOutcome)>,
}

impl RunReport {
    fn from_outcomes(run_id: String, outcomes: Vec<(String, SceneOutcome)>) -> Self {
        let succeeded = outcomes
            .iter()
            .filter(|(_, o)| *o == SceneOutcome::Succeeded)
            .count();
        let failed = outcomes.len() - succeeded;
        Self {
            run_id,
            status: if failed == 0 {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed
            },
            total: outcomes.len(),
            succeeded,
            failed,
            outcomes,
        }
    }
}

/// Drives orchestration runs.
pub struct Orchestrator {
    config: ForgeConfig,
    catalog: Arc<dyn CatalogApi>,
    sources: Arc<SourceManager>,
    sink: Arc<dyn LogSink>,
    fetcher: Arc<dyn BlobFetcher>,
}

impl Orchestrator {
    pub fn new(
        config: ForgeConfig,
        catalog: Arc<dyn CatalogApi>,
        sources: Arc<SourceManager>,
        sink: Arc<dyn LogSink>,
        fetcher: Arc<dyn BlobFetcher>,
    ) -> Self {
        Self {
            config,
            catalog,
            sources,
            sink,
            fetcher,
        }
    }

    /// Runs one orchestration to completion.
    ///
    /// `cancel` flips to true to stop dispatching new scene work;
    /// in-flight scenes finish on their own.
    ///
    /// # Errors
    ///
    /// Only fatal setup failures return `Err`; per-scene failures are
    /// recorded in the report instead.
    pub async fn run(
        &self,
        run_id: &str,
        info: &RunInfo,
        store: Arc<dyn ObjectStore>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, OrchestrationError> {
        let logger = RunLogger::new(Arc::clone(&self.sink), run_id, ORCHESTRATION_NAME);
        logger.info(
            module_path!(),
            "run",
            &format!("starting orchestration {ORCHESTRATION_NAME} with id {run_id}"),
        );

        if let Err(e) = info.check_crawling_options() {
            logger.error(module_path!(), "run", &e.to_string());
            return Err(e);
        }

        // Template fetch and compile are fatal before any scene runs.
        let environment = Arc::new(self.load_template(info).await.map_err(|e| {
            logger.error(module_path!(), "run", &e.to_string());
            OrchestrationError::Template(e)
        })?);

        // The collection must exist before items are submitted into it.
        if let Err(e) = self.catalog.get_collection(&info.target_collection_id).await {
            logger.error(module_path!(), "run", &e.to_string());
            return Err(OrchestrationError::Catalog(e));
        }

        let crawl_logger = logger.activity(CRAWL_ACTIVITY);
        let descriptor = info.descriptor();
        crawl_logger.info(
            module_path!(),
            "crawl",
            &format!("crawling {} scenes from {}", descriptor.kind(), store.container_url()),
        );
        let scenes = match crawler::collect(store.as_ref(), &descriptor).await {
            Ok(scenes) => scenes,
            Err(e) => {
                crawl_logger.error(module_path!(), "crawl", &e.to_string());
                return Err(OrchestrationError::Crawl(e));
            }
        };
        crawl_logger.info(
            module_path!(),
            "crawl",
            &format!("found {} scenes", scenes.len()),
        );
        if scenes.is_empty() {
            warn!(run_id, "no scenes found");
            return Ok(RunReport::from_outcomes(run_id.to_string(), Vec::new()));
        }

        // One credential shared by every worker; minting failure is
        // fatal for the run.
        self.sources
            .ensure_source(store.as_ref())
            .await
            .map_err(|e| {
                logger.error(module_path!(), "run", &e.to_string());
                OrchestrationError::Source(e)
            })?;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_scenes));
        let mut workers = JoinSet::new();
        for (index, scene) in scenes.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let environment = Arc::clone(&environment);
            let catalog = Arc::clone(&self.catalog);
            let scene = scene.clone();
            let scene_logger = logger.activity(TRANSFORM_ACTIVITY).with_scene(&scene.identifier());
            let collection_id = info.target_collection_id.clone();
            let on_conflict = self.config.on_conflict;
            let retry = RetryPolicy::new(self.config.retry_attempts, self.config.retry_wait);
            let poll_interval = self.config.poll_interval;
            let scene_timeout = self.config.scene_timeout;
            let cancel = cancel.clone();

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (index, SceneOutcome::Failed("worker pool closed".to_string()))
                    }
                };
                // Cancellation stops dispatch; scenes already past this
                // point run to completion.
                if *cancel.borrow() {
                    scene_logger.warning(
                        module_path!(),
                        "process_scene",
                        "run cancelled before scene was dispatched",
                    );
                    return (index, SceneOutcome::Failed("run cancelled".to_string()));
                }
                scene_logger.info(module_path!(), "process_scene", "processing scene");
                let outcome = match tokio::time::timeout(
                    scene_timeout,
                    process_scene(
                        environment,
                        catalog,
                        &scene,
                        &collection_id,
                        on_conflict,
                        &retry,
                        poll_interval,
                        &scene_logger,
                    ),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => SceneOutcome::Failed(format!(
                        "scene processing timed out after {}s",
                        scene_timeout.as_secs()
                    )),
                };
                match &outcome {
                    SceneOutcome::Succeeded => {
                        scene_logger.info(module_path!(), "process_scene", "scene succeeded")
                    }
                    SceneOutcome::Failed(reason) => {
                        scene_logger.error(module_path!(), "process_scene", reason)
                    }
                    SceneOutcome::Pending => {}
                }
                (index, outcome)
            });
        }

        let mut outcomes: Vec<(String, SceneOutcome)> = scenes
            .iter()
            .map(|s| (s.identifier(), SceneOutcome::Pending))
            .collect();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index].1 = outcome,
                Err(e) => warn!(run_id, error = %e, "scene worker panicked"),
            }
        }
        // A panicked worker leaves Pending behind; fold it into a failure
        // so the report stays complete.
        for (_, outcome) in outcomes.iter_mut() {
            if *outcome == SceneOutcome::Pending {
                *outcome = SceneOutcome::Failed("scene worker aborted".to_string());
            }
        }

        let report = RunReport::from_outcomes(run_id.to_string(), outcomes);
        logger.info(
            module_path!(),
            "run",
            &format!(
                "run finished: {} total, {} succeeded, {} failed",
                report.total, report.succeeded, report.failed
            ),
        );
        info!(
            run_id,
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            "orchestration finished"
        );
        Ok(report)
    }

    /// Fetches and compiles the template; both failures are fatal.
    async fn load_template(&self, info: &RunInfo) -> Result<Environment, RenderError> {
        let fetcher = Arc::clone(&self.fetcher);
        let url = info.template_url.clone();
        let bytes = tokio::task::spawn_blocking(move || fetcher.fetch(&url))
            .await
            .map_err(|e| RenderError::Runtime(e.to_string()))?
            .map_err(|e| match e {
                crate::error::EngineError::ResourceNotFound(url) => {
                    RenderError::TemplateNotFound(url)
                }
                other => RenderError::Runtime(other.to_string()),
            })?;
        let source = String::from_utf8(bytes)
            .map_err(|e| RenderError::Syntax(format!("template is not UTF-8: {e}")))?;
        let mut environment = Environment::new(Arc::clone(&self.fetcher));
        environment.compile(TEMPLATE_NAME, &source)?;
        Ok(environment)
    }
}

/// One scene, end to end: render on the blocking pool, validate, submit,
/// poll the ingestion operation to a terminal state.
#[allow(clippy::too_many_arguments)]
async fn process_scene(
    environment: Arc<Environment>,
    catalog: Arc<dyn CatalogApi>,
    scene: &Scene,
    collection_id: &str,
    on_conflict: ConflictMode,
    retry: &RetryPolicy,
    poll_interval: Duration,
    logger: &RunLogger,
) -> SceneOutcome {
    let context = scene.to_context();
    let rendered = {
        let environment = Arc::clone(&environment);
        tokio::task::spawn_blocking(move || {
            environment.render_item(TEMPLATE_NAME, &context, None)
        })
        .await
    };
    let item = match rendered {
        Ok(Ok(item)) => item,
        // Render and validation failures are terminal for the scene,
        // never retried.
        Ok(Err(e)) => return SceneOutcome::Failed(e.to_string()),
        Err(e) => return SceneOutcome::Failed(format!("render task failed: {e}")),
    };
    logger.debug(
        module_path!(),
        "process_scene",
        &format!("rendered item '{}'", item.id),
    );

    let operation_id = match retry
        .run(
            || {
                let catalog = Arc::clone(&catalog);
                let collection_id = collection_id.to_string();
                let item = item.clone();
                async move { catalog.submit_item(&collection_id, &item, on_conflict).await }
            },
            CatalogError::is_transient,
        )
        .await
    {
        Ok(id) => id,
        Err(e) => return SceneOutcome::Failed(format!("submission failed: {e}")),
    };
    logger.debug(
        module_path!(),
        "process_scene",
        &format!("submitted item '{}', operation {operation_id}", item.id),
    );

    loop {
        let status = match retry
            .run(
                || {
                    let catalog = Arc::clone(&catalog);
                    let operation_id = operation_id.clone();
                    async move { catalog.get_operation(&operation_id).await }
                },
                CatalogError::is_transient,
            )
            .await
        {
            Ok(status) => status,
            Err(e) => {
                return SceneOutcome::Failed(format!(
                    "polling operation {operation_id} failed: {e}"
                ))
            }
        };
        match status {
            OperationStatus::Succeeded => return SceneOutcome::Succeeded,
            OperationStatus::Failed => {
                return SceneOutcome::Failed(format!(
                    "ingestion operation {operation_id} failed"
                ))
            }
            OperationStatus::Running => tokio::time::sleep(poll_interval).await,
        }
    }
}

/// Parses and validates a trigger payload.
pub fn parse_run_info(payload: &Value) -> Result<RunInfo, OrchestrationError> {
    let info: RunInfo = serde_json::from_value(payload.clone())
        .map_err(|e| OrchestrationError::InvalidPayload(e.to_string()))?;
    info.check_crawling_options()?;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_payload() -> Value {
        json!({
            "crawlingType": "file",
            "sourceStorageAccountName": "acct",
            "sourceContainerName": "data",
            "pattern": "*.tif",
            "templateUrl": "https://acct.blob.core.windows.net/templates/t.json",
            "targetCollectionId": "c1"
        })
    }

    #[test]
    fn payload_round_trip() {
        let info = parse_run_info(&base_payload()).unwrap();
        assert_eq!(info.crawling_type, CrawlingType::File);
        assert_eq!(info.pattern.as_deref(), Some("*.tif"));
        assert_eq!(
            info.index_file_ignore_lines_starting_with.as_deref(),
            Some("#")
        );
        assert!(!info.validate);
    }

    #[test]
    fn index_crawl_requires_index_path() {
        let mut payload = base_payload();
        payload["crawlingType"] = json!("index");
        payload.as_object_mut().unwrap().remove("pattern");
        assert!(matches!(
            parse_run_info(&payload),
            Err(OrchestrationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn pattern_conflicts_with_index_crawl() {
        let mut payload = base_payload();
        payload["crawlingType"] = json!("index");
        payload["indexFilePath"] = json!("index.ndjson");
        assert!(matches!(
            parse_run_info(&payload),
            Err(OrchestrationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn file_crawl_rejects_index_path() {
        let mut payload = base_payload();
        payload["indexFilePath"] = json!("index.ndjson");
        assert!(parse_run_info(&payload).is_err());
    }

    #[test]
    fn malformed_payload_rejected() {
        assert!(parse_run_info(&json!({"crawlingType": "file"})).is_err());
        assert!(parse_run_info(&json!("not an object")).is_err());
    }

    #[test]
    fn descriptor_mapping() {
        let info = parse_run_info(&base_payload()).unwrap();
        assert!(matches!(
            info.descriptor(),
            CrawlDescriptor::File { pattern: Some(p), .. } if p == "*.tif"
        ));
    }

    #[test]
    fn report_tally() {
        let report = RunReport::from_outcomes(
            "run-1".to_string(),
            vec![
                ("a".to_string(), SceneOutcome::Succeeded),
                ("b".to_string(), SceneOutcome::Failed("bad".to_string())),
                ("c".to_string(), SceneOutcome::Succeeded),
            ],
        );
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
    }
}

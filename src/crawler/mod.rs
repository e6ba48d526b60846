//! Scene enumeration.
//!
//! A crawl turns one source container into a lazy sequence of scenes.
//! Dispatch is a closed enum: blob listings matched against a glob, one
//! level of common prefixes, or the lines of an index file. Order is
//! whatever the listing API returns. A missing crawl root fails the
//! crawl; a single malformed index line is skipped with a warning.

use futures::Stream;
use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::error::{CrawlError, StorageError};
use crate::storage::ObjectStore;

/// One unit of work produced by a crawl.
#[derive(Debug, Clone, PartialEq)]
pub enum Scene {
    /// URL of one matched blob.
    File(String),
    /// URL of one first-level "directory" prefix.
    Directory(String),
    /// One record from an index file: a raw line, or a parsed NDJSON
    /// object.
    Record(Value),
}

impl Scene {
    /// Identifier used in log records and the per-scene outcome table.
    pub fn identifier(&self) -> String {
        match self {
            Scene::File(url) | Scene::Directory(url) => url.clone(),
            Scene::Record(Value::String(s)) => s.clone(),
            Scene::Record(value) => value.to_string(),
        }
    }

    /// Value bound to `scene_info` during rendering.
    pub fn to_context(&self) -> Value {
        match self {
            Scene::File(url) | Scene::Directory(url) => Value::String(url.clone()),
            Scene::Record(value) => value.clone(),
        }
    }
}

/// What to crawl. Each variant is one crawling policy.
#[derive(Debug, Clone)]
pub enum CrawlDescriptor {
    /// List blobs under `prefix`, keep names matching `pattern`.
    File {
        prefix: Option<String>,
        pattern: Option<String>,
    },
    /// List first-level common prefixes under `prefix`, keep names
    /// matching `pattern`.
    Directory {
        prefix: Option<String>,
        pattern: Option<String>,
    },
    /// Read one index file; every line (or NDJSON object) is a scene.
    Index {
        path: String,
        ndjson: bool,
        ignore_lines_starting_with: Option<String>,
    },
}

impl CrawlDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            CrawlDescriptor::File { .. } => "file",
            CrawlDescriptor::Directory { .. } => "directory",
            CrawlDescriptor::Index { .. } => "index",
        }
    }
}

fn root_error(descriptor: &CrawlDescriptor, store: &dyn ObjectStore, e: StorageError) -> CrawlError {
    match e {
        StorageError::NotFound(_) | StorageError::Service { status: 404, .. } => {
            if let CrawlDescriptor::Index { path, .. } = descriptor {
                CrawlError::IndexNotFound(path.clone())
            } else {
                CrawlError::SourceUnavailable(store.container_url())
            }
        }
        other => CrawlError::Storage(other),
    }
}

/// Enumerates the scenes selected by `descriptor`, lazily.
///
/// The stream is finite and not restartable; re-crawling re-enumerates
/// from scratch.
pub fn enumerate<'a>(
    store: &'a dyn ObjectStore,
    descriptor: &'a CrawlDescriptor,
) -> impl Stream<Item = Result<Scene, CrawlError>> + 'a {
    async_stream::try_stream! {
        match descriptor {
            CrawlDescriptor::File { prefix, pattern } => {
                let blobs = store
                    .list_blobs(prefix.as_deref(), pattern.as_deref())
                    .await
                    .map_err(|e| root_error(descriptor, store, e))?;
                info!(count = blobs.len(), pattern = ?pattern, "file crawl listed blobs");
                for url in blobs {
                    yield Scene::File(url);
                }
            }
            CrawlDescriptor::Directory { prefix, pattern } => {
                let regex = pattern
                    .as_deref()
                    .map(crate::storage::glob_to_regex)
                    .transpose()
                    .map_err(CrawlError::Storage)?;
                let prefixes = store
                    .list_prefixes(prefix.as_deref())
                    .await
                    .map_err(|e| root_error(descriptor, store, e))?;
                info!(count = prefixes.len(), "directory crawl listed prefixes");
                for url in prefixes {
                    let name = url.rsplit('/').next().unwrap_or(&url);
                    if regex.as_ref().map_or(true, |r| r.is_match(name)) {
                        yield Scene::Directory(url);
                    }
                }
            }
            CrawlDescriptor::Index {
                path,
                ndjson,
                ignore_lines_starting_with,
            } => {
                let bytes = store
                    .download(path)
                    .await
                    .map_err(|e| root_error(descriptor, store, e))?;
                let text = String::from_utf8_lossy(&bytes).to_string();
                info!(index = %path, lines = text.lines().count(), "index crawl read file");
                for line in text.lines() {
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    if let Some(marker) = ignore_lines_starting_with {
                        if !marker.is_empty() && line.starts_with(marker.as_str()) {
                            continue;
                        }
                    }
                    if *ndjson {
                        match serde_json::from_str::<Value>(line) {
                            Ok(record) => yield Scene::Record(record),
                            Err(e) => {
                                // Per-record failure, not a crawl failure.
                                warn!(index = %path, error = %e, "skipping malformed index line");
                            }
                        }
                    } else {
                        yield Scene::Record(Value::String(line.to_string()));
                    }
                }
            }
        }
    }
}

/// Drains the crawl into memory. The orchestrator needs the full scene
/// set up front to guarantee one outcome per scene.
pub async fn collect(
    store: &dyn ObjectStore,
    descriptor: &CrawlDescriptor,
) -> Result<Vec<Scene>, CrawlError> {
    let stream = enumerate(store, descriptor);
    tokio::pin!(stream);
    let mut scenes = Vec::new();
    while let Some(scene) = stream.next().await {
        scenes.push(scene?);
    }
    Ok(scenes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const CONTAINER: &str = "https://acct.blob.core.windows.net/data";

    fn store() -> MemoryStore {
        let store = MemoryStore::new(CONTAINER);
        store.insert("a.tif", b"x".to_vec());
        store.insert("a.tfw", b"x".to_vec());
        store.insert("b.tif", b"x".to_vec());
        store
    }

    #[tokio::test]
    async fn file_crawl_applies_glob() {
        let store = store();
        let descriptor = CrawlDescriptor::File {
            prefix: None,
            pattern: Some("*.tif".to_string()),
        };
        let scenes = collect(&store, &descriptor).await.unwrap();
        assert_eq!(
            scenes,
            vec![
                Scene::File(format!("{CONTAINER}/a.tif")),
                Scene::File(format!("{CONTAINER}/b.tif")),
            ]
        );
    }

    #[tokio::test]
    async fn directory_crawl_yields_prefixes() {
        let store = MemoryStore::new(CONTAINER);
        store.insert("east/a.tif", b"x".to_vec());
        store.insert("west/b.tif", b"x".to_vec());
        let descriptor = CrawlDescriptor::Directory {
            prefix: None,
            pattern: None,
        };
        let scenes = collect(&store, &descriptor).await.unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0], Scene::Directory(format!("{CONTAINER}/east")));
    }

    #[tokio::test]
    async fn index_crawl_skips_comments_and_bad_lines() {
        let store = MemoryStore::new(CONTAINER);
        store.insert(
            "index.ndjson",
            b"# header\n{\"scene\": \"one\"}\nnot json at all\n{\"scene\": \"two\"}\n".to_vec(),
        );
        let descriptor = CrawlDescriptor::Index {
            path: "index.ndjson".to_string(),
            ndjson: true,
            ignore_lines_starting_with: Some("#".to_string()),
        };
        let scenes = collect(&store, &descriptor).await.unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[0], Scene::Record(serde_json::json!({"scene": "one"})));
    }

    #[tokio::test]
    async fn index_crawl_plain_lines() {
        let store = MemoryStore::new(CONTAINER);
        store.insert("list.txt", b"scenes/a.tif\nscenes/b.tif\n\n".to_vec());
        let descriptor = CrawlDescriptor::Index {
            path: "list.txt".to_string(),
            ndjson: false,
            ignore_lines_starting_with: None,
        };
        let scenes = collect(&store, &descriptor).await.unwrap();
        assert_eq!(scenes.len(), 2);
        assert_eq!(scenes[1].identifier(), "scenes/b.tif");
    }

    #[tokio::test]
    async fn missing_index_is_fatal() {
        let store = MemoryStore::new(CONTAINER);
        let descriptor = CrawlDescriptor::Index {
            path: "missing.txt".to_string(),
            ndjson: false,
            ignore_lines_starting_with: None,
        };
        let err = collect(&store, &descriptor).await.unwrap_err();
        assert!(matches!(err, CrawlError::IndexNotFound(_)));
    }

    #[test]
    fn scene_identifiers() {
        assert_eq!(Scene::File("https://x/a.tif".into()).identifier(), "https://x/a.tif");
        assert_eq!(
            Scene::Record(serde_json::json!({"id": 7})).identifier(),
            "{\"id\":7}"
        );
    }
}

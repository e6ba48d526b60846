//! Catalog service client.
//!
//! The forge talks to the catalog over a small REST surface: collection
//! read/create, item submission (asynchronous, returns an operation id),
//! operation polling, and ingestion source registration. [`CatalogApi`]
//! is the seam; [`GeoCatalogClient`] is the HTTP implementation and
//! [`MemoryCatalog`] backs the tests.

mod client;

pub use client::{BearerProvider, GeoCatalogClient, StaticBearer};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::ConflictMode;
use crate::error::CatalogError;
use crate::stac::StacItem;

/// Connection details of one ingestion source registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Base URL of the registered container.
    pub container_url: String,
    /// Authoritative credential expiration reported by the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    /// The signed credential itself; only sent on creation, never
    /// returned by the service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sas_token: Option<String>,
}

/// One ingestion source registration held by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSource {
    pub id: String,
    pub source_type: String,
    pub connection_info: ConnectionInfo,
}

/// Status of an asynchronous item submission operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Running)
    }
}

/// Catalog service operations the forge consumes.
#[async_trait]
pub trait CatalogApi: Send + Sync {
    /// Reads a collection; `CollectionNotFound` when absent.
    async fn get_collection(&self, id: &str) -> Result<Value, CatalogError>;

    /// Creates a collection from its JSON document.
    async fn create_collection(&self, collection: &Value) -> Result<(), CatalogError>;

    /// Submits one item to a collection; returns the operation id to
    /// poll. `mode` carries the explicit id-collision choice.
    async fn submit_item(
        &self,
        collection_id: &str,
        item: &StacItem,
        mode: ConflictMode,
    ) -> Result<String, CatalogError>;

    /// Polls one submission operation.
    async fn get_operation(&self, id: &str) -> Result<OperationStatus, CatalogError>;

    /// Lists ingestion source registrations.
    async fn list_ingestion_sources(&self) -> Result<Vec<IngestionSource>, CatalogError>;

    /// Registers a container with a signed credential.
    async fn create_ingestion_source(
        &self,
        container_url: &str,
        sas_token: &str,
        expiration: DateTime<Utc>,
    ) -> Result<IngestionSource, CatalogError>;

    /// Deletes one registration.
    async fn delete_ingestion_source(&self, id: &str) -> Result<(), CatalogError>;
}

/// In-memory catalog used by tests: tracks registrations and submitted
/// items, and counts mutation calls for lifecycle assertions.
#[derive(Default)]
pub struct MemoryCatalog {
    collections: Mutex<HashMap<String, Value>>,
    items: Mutex<HashMap<String, Vec<StacItem>>>,
    sources: Mutex<Vec<IngestionSource>>,
    operations: Mutex<HashMap<String, OperationStatus>>,
    pub creates: AtomicU64,
    pub deletes: AtomicU64,
    /// Item ids that should be rejected with a client error on submit.
    pub reject_ids: Mutex<Vec<String>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(self, id: &str) -> Self {
        self.collections.lock().expect("catalog poisoned").insert(
            id.to_string(),
            serde_json::json!({"type": "Collection", "id": id}),
        );
        self
    }

    /// Seeds an existing registration.
    pub fn seed_source(&self, container_url: &str, expiration: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        self.sources
            .lock()
            .expect("catalog poisoned")
            .push(IngestionSource {
                id: id.clone(),
                source_type: "SasToken".to_string(),
                connection_info: ConnectionInfo {
                    container_url: container_url.to_string(),
                    expiration: Some(expiration),
                    sas_token: None,
                },
            });
        id
    }

    /// Seeds a registration whose expiration the service does not report.
    pub fn seed_source_without_expiration(&self, container_url: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.sources
            .lock()
            .expect("catalog poisoned")
            .push(IngestionSource {
                id: id.clone(),
                source_type: "SasToken".to_string(),
                connection_info: ConnectionInfo {
                    container_url: container_url.to_string(),
                    expiration: None,
                    sas_token: None,
                },
            });
        id
    }

    pub fn submitted_items(&self, collection_id: &str) -> Vec<StacItem> {
        self.items
            .lock()
            .expect("catalog poisoned")
            .get(collection_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn source_count(&self) -> usize {
        self.sources.lock().expect("catalog poisoned").len()
    }

    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogApi for MemoryCatalog {
    async fn get_collection(&self, id: &str) -> Result<Value, CatalogError> {
        self.collections
            .lock()
            .expect("catalog poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::CollectionNotFound(id.to_string()))
    }

    async fn create_collection(&self, collection: &Value) -> Result<(), CatalogError> {
        let id = collection
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogError::UnexpectedResponse("collection without id".into()))?;
        self.collections
            .lock()
            .expect("catalog poisoned")
            .insert(id.to_string(), collection.clone());
        Ok(())
    }

    async fn submit_item(
        &self,
        collection_id: &str,
        item: &StacItem,
        _mode: ConflictMode,
    ) -> Result<String, CatalogError> {
        if self
            .reject_ids
            .lock()
            .expect("catalog poisoned")
            .contains(&item.id)
        {
            return Err(CatalogError::Service {
                status: 409,
                message: format!("item '{}' already exists", item.id),
            });
        }
        self.items
            .lock()
            .expect("catalog poisoned")
            .entry(collection_id.to_string())
            .or_default()
            .push(item.clone());
        let op_id = Uuid::new_v4().to_string();
        self.operations
            .lock()
            .expect("catalog poisoned")
            .insert(op_id.clone(), OperationStatus::Succeeded);
        Ok(op_id)
    }

    async fn get_operation(&self, id: &str) -> Result<OperationStatus, CatalogError> {
        self.operations
            .lock()
            .expect("catalog poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::OperationNotFound(id.to_string()))
    }

    async fn list_ingestion_sources(&self) -> Result<Vec<IngestionSource>, CatalogError> {
        Ok(self.sources.lock().expect("catalog poisoned").clone())
    }

    async fn create_ingestion_source(
        &self,
        container_url: &str,
        sas_token: &str,
        expiration: DateTime<Utc>,
    ) -> Result<IngestionSource, CatalogError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let source = IngestionSource {
            id: Uuid::new_v4().to_string(),
            source_type: "SasToken".to_string(),
            connection_info: ConnectionInfo {
                container_url: container_url.to_string(),
                expiration: Some(expiration),
                sas_token: Some(sas_token.to_string()),
            },
        };
        self.sources
            .lock()
            .expect("catalog poisoned")
            .push(source.clone());
        Ok(source)
    }

    async fn delete_ingestion_source(&self, id: &str) -> Result<(), CatalogError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut sources = self.sources.lock().expect("catalog poisoned");
        let before = sources.len();
        sources.retain(|s| s.id != id);
        if sources.len() == before {
            return Err(CatalogError::Service {
                status: 404,
                message: format!("ingestion source '{id}' not found"),
            });
        }
        Ok(())
    }
}

//! HTTP implementation of [`CatalogApi`].
//!
//! Every call carries the `api-version` query parameter and a bearer
//! credential. The bearer token is cached and refreshed five minutes
//! before it expires. Transient failures (5xx, 408, 429) are retried with
//! a fixed wait; client errors are terminal.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::{CatalogApi, ConnectionInfo, IngestionSource, OperationStatus};
use crate::config::ConflictMode;
use crate::error::CatalogError;
use crate::retry::RetryPolicy;
use crate::stac::StacItem;

/// Margin before token expiry at which a fresh token is requested.
const TOKEN_REFRESH_MARGIN_MINUTES: i64 = 5;

/// Supplies bearer tokens for the catalog service.
#[async_trait]
pub trait BearerProvider: Send + Sync {
    /// Returns a token and its expiry.
    async fn acquire(&self) -> Result<(String, DateTime<Utc>), CatalogError>;
}

/// Fixed token, e.g. injected through configuration or a sidecar.
pub struct StaticBearer {
    token: String,
}

impl StaticBearer {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Reads the token from `STACFORGE_CATALOG_TOKEN`.
    pub fn from_env() -> Result<Self, CatalogError> {
        let token = std::env::var("STACFORGE_CATALOG_TOKEN")
            .map_err(|_| CatalogError::Credential("STACFORGE_CATALOG_TOKEN not set".into()))?;
        Ok(Self::new(token))
    }
}

#[async_trait]
impl BearerProvider for StaticBearer {
    async fn acquire(&self) -> Result<(String, DateTime<Utc>), CatalogError> {
        Ok((self.token.clone(), Utc::now() + ChronoDuration::hours(1)))
    }
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Client for the catalog REST surface.
pub struct GeoCatalogClient {
    base_url: String,
    api_version: String,
    provider: Box<dyn BearerProvider>,
    client: reqwest::Client,
    retry: RetryPolicy,
    token: Mutex<Option<CachedToken>>,
}

impl GeoCatalogClient {
    pub fn new(
        base_url: impl Into<String>,
        api_version: impl Into<String>,
        provider: Box<dyn BearerProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
            provider,
            client: reqwest::Client::new(),
            retry,
            token: Mutex::new(None),
        }
    }

    async fn bearer(&self) -> Result<String, CatalogError> {
        let mut cached = self.token.lock().await;
        let refresh_after = Utc::now() + ChronoDuration::minutes(TOKEN_REFRESH_MARGIN_MINUTES);
        let fresh_needed = match cached.as_ref() {
            Some(t) => t.expires_at < refresh_after,
            None => true,
        };
        if fresh_needed {
            debug!("acquiring fresh catalog bearer token");
            let (token, expires_at) = self.provider.acquire().await?;
            *cached = Some(CachedToken { token, expires_at });
        }
        Ok(cached.as_ref().map(|t| t.token.clone()).unwrap_or_default())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, CatalogError> {
        let url = self.url(path);
        self.retry
            .run(
                || async {
                    let token = self.bearer().await?;
                    let mut request = self
                        .client
                        .request(method.clone(), &url)
                        .query(&[("api-version", self.api_version.as_str())])
                        .bearer_auth(&token);
                    if let Some(json) = body {
                        request = request.json(json);
                    }
                    debug!(%url, method = %method, "catalog request");
                    let response = request
                        .send()
                        .await
                        .map_err(|e| CatalogError::Request(e.to_string()))?;
                    let status = response.status();
                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(CatalogError::Service {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    let text = response
                        .text()
                        .await
                        .map_err(|e| CatalogError::Request(e.to_string()))?;
                    if text.is_empty() {
                        return Ok(Value::Null);
                    }
                    serde_json::from_str(&text)
                        .map_err(|e| CatalogError::UnexpectedResponse(e.to_string()))
                },
                CatalogError::is_transient,
            )
            .await
    }
}

#[async_trait]
impl CatalogApi for GeoCatalogClient {
    async fn get_collection(&self, id: &str) -> Result<Value, CatalogError> {
        match self
            .request(reqwest::Method::GET, &format!("/stac/collections/{id}"), None)
            .await
        {
            Ok(value) => Ok(value),
            Err(CatalogError::Service { status: 404, .. }) => {
                Err(CatalogError::CollectionNotFound(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn create_collection(&self, collection: &Value) -> Result<(), CatalogError> {
        let id = collection
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| CatalogError::UnexpectedResponse("collection without id".into()))?;
        self.request(
            reqwest::Method::POST,
            &format!("/stac/collections/{id}"),
            Some(collection),
        )
        .await?;
        Ok(())
    }

    async fn submit_item(
        &self,
        collection_id: &str,
        item: &StacItem,
        mode: ConflictMode,
    ) -> Result<String, CatalogError> {
        let path = format!(
            "/stac/collections/{collection_id}/items?onConflict={mode}"
        );
        let response = self
            .request(reqwest::Method::POST, &path, Some(&item.to_value()))
            .await?;
        response
            .get("operationId")
            .or_else(|| response.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                CatalogError::UnexpectedResponse("submission returned no operation id".into())
            })
    }

    async fn get_operation(&self, id: &str) -> Result<OperationStatus, CatalogError> {
        let response = self
            .request(reqwest::Method::GET, &format!("/inma/operations/{id}"), None)
            .await?;
        let status = response
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CatalogError::UnexpectedResponse("operation returned no status".into())
            })?;
        match status {
            "Running" | "Pending" => Ok(OperationStatus::Running),
            "Succeeded" => Ok(OperationStatus::Succeeded),
            "Failed" | "Canceled" => Ok(OperationStatus::Failed),
            other => Err(CatalogError::UnexpectedResponse(format!(
                "unknown operation status '{other}'"
            ))),
        }
    }

    async fn list_ingestion_sources(&self) -> Result<Vec<IngestionSource>, CatalogError> {
        let response = self
            .request(reqwest::Method::GET, "/inma/ingestion-sources", None)
            .await?;
        let entries = response
            .get("value")
            .cloned()
            .unwrap_or(response);
        serde_json::from_value(entries)
            .map_err(|e| CatalogError::UnexpectedResponse(e.to_string()))
    }

    async fn create_ingestion_source(
        &self,
        container_url: &str,
        sas_token: &str,
        expiration: DateTime<Utc>,
    ) -> Result<IngestionSource, CatalogError> {
        let body = serde_json::json!({
            "sourceType": "SasToken",
            "connectionInfo": {
                "containerUrl": container_url,
                "sasToken": sas_token,
            }
        });
        let response = self
            .request(reqwest::Method::POST, "/inma/ingestion-sources", Some(&body))
            .await?;
        let mut source: IngestionSource = serde_json::from_value(response)
            .map_err(|e| CatalogError::UnexpectedResponse(e.to_string()))?;
        // The service echoes the expiration; fall back to what was minted.
        if source.connection_info.expiration.is_none() {
            source.connection_info = ConnectionInfo {
                expiration: Some(expiration),
                ..source.connection_info
            };
        }
        Ok(source)
    }

    async fn delete_ingestion_source(&self, id: &str) -> Result<(), CatalogError> {
        self.request(
            reqwest::Method::DELETE,
            &format!("/inma/ingestion-sources/{id}"),
            None,
        )
        .await?;
        Ok(())
    }
}

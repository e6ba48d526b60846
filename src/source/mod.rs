//! Ingestion source lifecycle.
//!
//! The catalog reads generated assets out of the source container through
//! a registered signed credential. [`SourceManager`] owns that lifecycle:
//! reuse a registration whose expiration is comfortably in the future,
//! otherwise delete it and create a fresh one. The check-expiry-and-
//! recreate sequence is serialized per container so concurrent scene
//! workers cannot race into duplicate registrations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::catalog::{CatalogApi, ConnectionInfo};
use crate::error::SourceError;
use crate::storage::{ObjectStore, SasPermissions};

/// Manages ingestion source registrations for source containers.
pub struct SourceManager {
    catalog: Arc<dyn CatalogApi>,
    /// Recreate when the credential expires within this margin.
    refresh_margin: Duration,
    /// Lifetime of freshly minted credentials.
    sas_lifetime: Duration,
    /// One lock per container URL around check-expiry-and-recreate.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SourceManager {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        refresh_margin: Duration,
        sas_lifetime: Duration,
    ) -> Self {
        Self {
            catalog,
            refresh_margin,
            sas_lifetime,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn container_lock(&self, container_url: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(container_url.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Ensures the catalog holds a usable registration for `store`'s
    /// container, reusing or recreating as needed.
    ///
    /// Reuse performs zero mutation calls. Recreation deletes the stale
    /// registration (if any) and creates exactly one replacement.
    ///
    /// # Errors
    ///
    /// `SourceError::MintFailed` when the signed credential cannot be
    /// minted (fatal for the run); catalog errors bubble up after the
    /// client's retry policy is exhausted.
    pub async fn ensure_source(
        &self,
        store: &dyn ObjectStore,
    ) -> Result<ConnectionInfo, SourceError> {
        let container_url = store.container_url();
        let lock = self.container_lock(&container_url).await;
        let _guard = lock.lock().await;

        let existing = self
            .catalog
            .list_ingestion_sources()
            .await?
            .into_iter()
            .find(|s| s.connection_info.container_url == container_url);

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::hours(1));

        if let Some(source) = &existing {
            // The service's expiration timestamp is authoritative; the
            // token string itself is never inspected.
            if let Some(expiration) = source.connection_info.expiration {
                if expiration > deadline {
                    debug!(%container_url, %expiration, "reusing ingestion source");
                    return Ok(source.connection_info.clone());
                }
            }
            info!(
                %container_url,
                id = %source.id,
                "ingestion source expired or expiring, recreating"
            );
            self.catalog.delete_ingestion_source(&source.id).await?;
        } else {
            info!(%container_url, "no ingestion source registered, creating one");
        }

        let expiration = self.mint_expiration();
        let sas = store
            .mint_sas(expiration, SasPermissions::read_list())
            .await
            .map_err(|e| SourceError::MintFailed {
                container: container_url.clone(),
                message: e.to_string(),
            })?;

        let created = self
            .catalog
            .create_ingestion_source(&container_url, &sas, expiration)
            .await?;

        Ok(created.connection_info)
    }

    fn mint_expiration(&self) -> DateTime<Utc> {
        Utc::now()
            + chrono::Duration::from_std(self.sas_lifetime)
                .unwrap_or_else(|_| chrono::Duration::hours(24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::storage::MemoryStore;

    const CONTAINER: &str = "https://acct.blob.core.windows.net/data";

    fn manager(catalog: Arc<MemoryCatalog>) -> SourceManager {
        SourceManager::new(
            catalog,
            Duration::from_secs(3600),
            Duration::from_secs(24 * 3600),
        )
    }

    #[tokio::test]
    async fn fresh_registration_is_reused_without_mutation() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.seed_source(CONTAINER, Utc::now() + chrono::Duration::hours(12));
        let store = MemoryStore::new(CONTAINER);
        let manager = manager(Arc::clone(&catalog));

        let info = manager.ensure_source(&store).await.unwrap();
        assert_eq!(info.container_url, CONTAINER);
        assert_eq!(catalog.create_count(), 0);
        assert_eq!(catalog.delete_count(), 0);
        assert_eq!(store.minted_count(), 0);
    }

    #[tokio::test]
    async fn expiring_registration_is_deleted_and_recreated_once() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.seed_source(CONTAINER, Utc::now() + chrono::Duration::minutes(10));
        let store = MemoryStore::new(CONTAINER);
        let manager = manager(Arc::clone(&catalog));

        let info = manager.ensure_source(&store).await.unwrap();
        assert!(info.expiration.unwrap() > Utc::now() + chrono::Duration::hours(23));
        assert_eq!(catalog.delete_count(), 1);
        assert_eq!(catalog.create_count(), 1);
        assert_eq!(catalog.source_count(), 1);
        assert_eq!(store.minted_count(), 1);
    }

    #[tokio::test]
    async fn missing_expiration_triggers_recreation() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.seed_source_without_expiration(CONTAINER);
        let store = MemoryStore::new(CONTAINER);
        let manager = manager(Arc::clone(&catalog));

        let info = manager.ensure_source(&store).await.unwrap();
        assert!(info.expiration.is_some());
        assert_eq!(catalog.delete_count(), 1);
        assert_eq!(catalog.create_count(), 1);
        assert_eq!(catalog.source_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_recreates_at_most_once() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.seed_source(CONTAINER, Utc::now() + chrono::Duration::minutes(5));
        let store = Arc::new(MemoryStore::new(CONTAINER));
        let manager = Arc::new(manager(Arc::clone(&catalog)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                manager.ensure_source(store.as_ref()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(catalog.create_count(), 1);
        assert_eq!(catalog.delete_count(), 1);
        assert_eq!(catalog.source_count(), 1);
    }
}

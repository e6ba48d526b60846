//! Error types for stacforge operations.
//!
//! Defines error types for all major subsystems:
//! - Scene crawling
//! - Blob storage access and SAS minting
//! - Raster metadata extraction
//! - Template rendering
//! - Catalog service interactions
//! - Ingestion source lifecycle
//! - Orchestration runs

use thiserror::Error;

/// Errors that can occur while enumerating scenes from a source.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Crawl root '{0}' does not exist or is not accessible")]
    SourceUnavailable(String),

    #[error("Index file '{0}' not found")]
    IndexNotFound(String),

    #[error("Storage error during crawl: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid crawl descriptor: {0}")]
    InvalidDescriptor(String),
}

/// Errors that can occur while talking to blob storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Blob '{0}' not found")]
    NotFound(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Storage service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Failed to parse listing response: {0}")]
    ListingParse(String),

    #[error("Invalid glob pattern '{0}'")]
    InvalidPattern(String),

    #[error("SAS minting failed: {0}")]
    SasMint(String),

    #[error("Invalid container URL '{0}'")]
    InvalidUrl(String),
}

impl StorageError {
    /// Whether the error is worth retrying (transient service failure).
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Request(_) => true,
            StorageError::Service { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Errors raised by raster metadata extraction.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("Unsupported raster driver: {0}")]
    UnsupportedDriver(String),

    #[error("Truncated or invalid raster file: {0}")]
    Invalid(String),

    #[error("Raster resource unreachable: {0}")]
    Unreachable(String),

    #[error("Unsupported coordinate reference system: {0}")]
    UnsupportedCrs(String),
}

/// Errors raised by the template function library. Surfaced by the
/// renderer as a scene-level rendering failure, never a process crash.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Resource fetch failed: {0}")]
    Transport(String),

    #[error("Resource server returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl EngineError {
    /// Whether the error is worth retrying (transient service failure).
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Transport(_) => true,
            EngineError::Service { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Errors that can occur while rendering a template into a STAC item.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Template syntax error: {0}")]
    Syntax(String),

    #[error("Template '{0}' not found")]
    TemplateNotFound(String),

    #[error("Template runtime error: {0}")]
    Runtime(String),

    #[error("Rendered output is not valid JSON: {0}")]
    Json(String),

    #[error("Rendered output is not a valid STAC item: {0}")]
    Stac(String),
}

impl RenderError {
    /// Syntax and missing-template errors abort the whole run; the rest
    /// fail only the scene being rendered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RenderError::Syntax(_) | RenderError::TemplateNotFound(_)
        )
    }
}

/// Errors returned by the catalog service client.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Catalog service returned {status}: {message}")]
    Service { status: u16, message: String },

    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Operation '{0}' not found")]
    OperationNotFound(String),

    #[error("No bearer credential available: {0}")]
    Credential(String),
}

impl CatalogError {
    /// Whether the error is worth retrying (transient service failure).
    pub fn is_transient(&self) -> bool {
        match self {
            CatalogError::Request(_) => true,
            CatalogError::Service { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

/// Errors raised by the ingestion source manager.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to mint a signed credential for '{container}': {message}")]
    MintFailed { container: String, message: String },

    #[error("Catalog error while managing ingestion sources: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid container URL '{0}'")]
    InvalidContainerUrl(String),
}

/// Errors that abort an orchestration run before any scene is processed.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("Invalid trigger payload: {0}")]
    InvalidPayload(String),

    #[error("Template error: {0}")]
    Template(#[from] RenderError),

    #[error("Crawl failed: {0}")]
    Crawl(#[from] CrawlError),

    #[error("Ingestion source setup failed: {0}")]
    Source(#[from] SourceError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_transient_classification() {
        assert!(StorageError::Service {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(StorageError::Service {
            status: 429,
            message: "throttled".into()
        }
        .is_transient());
        assert!(!StorageError::Service {
            status: 404,
            message: "missing".into()
        }
        .is_transient());
        assert!(!StorageError::NotFound("a.tif".into()).is_transient());
    }

    #[test]
    fn catalog_transient_classification() {
        assert!(CatalogError::Request("connection reset".into()).is_transient());
        assert!(!CatalogError::Service {
            status: 409,
            message: "duplicate id".into()
        }
        .is_transient());
    }

    #[test]
    fn render_fatality() {
        assert!(RenderError::Syntax("unexpected end of block".into()).is_fatal());
        assert!(!RenderError::Runtime("missing field".into()).is_fatal());
        assert!(!RenderError::Json("trailing comma".into()).is_fatal());
    }
}

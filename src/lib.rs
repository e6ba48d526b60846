//! stacforge: template-driven STAC item generation for a geospatial
//! catalog service.
//!
//! The pipeline crawls a blob container for scenes, renders each scene
//! through a user-supplied template into a STAC item, validates the
//! item's shape, and submits it to the catalog, keeping the container's
//! ingestion credential registered along the way. Runs are triggered
//! over HTTP or from the CLI and report one outcome per scene.

pub mod catalog;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod engine;
pub mod error;
pub mod logsink;
pub mod orchestrator;
pub mod retry;
pub mod server;
pub mod source;
pub mod stac;
pub mod storage;

pub use config::ForgeConfig;
pub use error::{
    CatalogError, CrawlError, EngineError, OrchestrationError, RasterError, RenderError,
    SourceError, StorageError,
};
pub use orchestrator::{Orchestrator, RunInfo, RunReport, RunStatus, SceneOutcome};
pub use stac::StacItem;

//! Configuration for the forge pipeline.
//!
//! All settings can come from environment variables, with builder methods
//! for programmatic construction and a `validate()` pass before use.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Behavior when a submitted item's id collides with an existing item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Let the catalog reject the duplicate (per-scene terminal failure).
    Reject,
    /// Ask the catalog to overwrite the existing item.
    Overwrite,
}

impl std::fmt::Display for ConflictMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictMode::Reject => write!(f, "reject"),
            ConflictMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

impl std::str::FromStr for ConflictMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(ConflictMode::Reject),
            "overwrite" => Ok(ConflictMode::Overwrite),
            other => Err(format!("unknown conflict mode '{other}'")),
        }
    }
}

/// Configuration for the forge.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Catalog settings
    /// Base URL of the catalog service.
    pub catalog_url: String,
    /// API version query parameter sent with every catalog call.
    pub api_version: String,
    /// Behavior on item id collision.
    pub on_conflict: ConflictMode,

    // Storage settings
    /// DNS suffix for blob storage endpoints.
    pub storage_endpoint_suffix: String,
    /// Shared account key used to sign SAS tokens, if available.
    pub storage_account_key: Option<String>,

    // Credential lifecycle
    /// Recreate an ingestion source when its credential expires within
    /// this margin.
    pub source_refresh_margin: Duration,
    /// Lifetime of freshly minted SAS credentials.
    pub sas_lifetime: Duration,

    // Orchestration settings
    /// Maximum number of scenes processed concurrently.
    pub max_concurrent_scenes: usize,
    /// Overall timeout for one scene's render-validate-submit pipeline.
    pub scene_timeout: Duration,
    /// Attempts for transient catalog/storage failures.
    pub retry_attempts: u32,
    /// Fixed wait between retry attempts.
    pub retry_wait: Duration,
    /// Interval between submission operation polls.
    pub poll_interval: Duration,

    // Server settings
    /// Listen address for the HTTP trigger surface.
    pub listen_addr: String,

    // Log sink
    /// Path of the append-only NDJSON log table. `None` keeps records
    /// in memory only.
    pub log_table_path: Option<PathBuf>,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            catalog_url: "http://localhost:8081".to_string(),
            api_version: "2024-01-31-preview".to_string(),
            on_conflict: ConflictMode::Reject,
            storage_endpoint_suffix: "blob.core.windows.net".to_string(),
            storage_account_key: None,
            source_refresh_margin: Duration::from_secs(3600),
            sas_lifetime: Duration::from_secs(24 * 3600),
            max_concurrent_scenes: 8,
            scene_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_wait: Duration::from_secs(2),
            poll_interval: Duration::from_secs(2),
            listen_addr: "0.0.0.0:8080".to_string(),
            log_table_path: Some(PathBuf::from("./logs/forge.ndjson")),
        }
    }
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `STACFORGE_CATALOG_URL`: Catalog service base URL (required)
    /// - `STACFORGE_API_VERSION`: API version parameter
    /// - `STACFORGE_ON_CONFLICT`: `reject` or `overwrite`
    /// - `STACFORGE_STORAGE_SUFFIX`: Blob endpoint DNS suffix
    /// - `STACFORGE_STORAGE_ACCOUNT_KEY`: Shared key for SAS signing
    /// - `STACFORGE_SOURCE_REFRESH_MARGIN_SECS`: Credential refresh margin
    /// - `STACFORGE_SAS_LIFETIME_SECS`: Minted SAS lifetime
    /// - `STACFORGE_MAX_CONCURRENT_SCENES`: Worker pool width
    /// - `STACFORGE_SCENE_TIMEOUT_SECS`: Per-scene timeout
    /// - `STACFORGE_RETRY_ATTEMPTS`: Transient retry attempts
    /// - `STACFORGE_RETRY_WAIT_SECS`: Wait between attempts
    /// - `STACFORGE_POLL_INTERVAL_SECS`: Operation poll interval
    /// - `STACFORGE_LISTEN_ADDR`: HTTP trigger listen address
    /// - `STACFORGE_LOG_TABLE`: NDJSON log table path
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have
    /// invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        config.catalog_url = std::env::var("STACFORGE_CATALOG_URL")
            .map_err(|_| ConfigError::MissingEnvVar("STACFORGE_CATALOG_URL".to_string()))?;

        if let Ok(val) = std::env::var("STACFORGE_API_VERSION") {
            config.api_version = val;
        }

        if let Ok(val) = std::env::var("STACFORGE_ON_CONFLICT") {
            config.on_conflict =
                val.parse()
                    .map_err(|message| ConfigError::InvalidValue {
                        key: "STACFORGE_ON_CONFLICT".to_string(),
                        message,
                    })?;
        }

        if let Ok(val) = std::env::var("STACFORGE_STORAGE_SUFFIX") {
            config.storage_endpoint_suffix = val;
        }

        config.storage_account_key = std::env::var("STACFORGE_STORAGE_ACCOUNT_KEY").ok();

        if let Ok(val) = std::env::var("STACFORGE_SOURCE_REFRESH_MARGIN_SECS") {
            config.source_refresh_margin =
                Duration::from_secs(parse_env_value(&val, "STACFORGE_SOURCE_REFRESH_MARGIN_SECS")?);
        }

        if let Ok(val) = std::env::var("STACFORGE_SAS_LIFETIME_SECS") {
            config.sas_lifetime =
                Duration::from_secs(parse_env_value(&val, "STACFORGE_SAS_LIFETIME_SECS")?);
        }

        if let Ok(val) = std::env::var("STACFORGE_MAX_CONCURRENT_SCENES") {
            config.max_concurrent_scenes =
                parse_env_value(&val, "STACFORGE_MAX_CONCURRENT_SCENES")?;
        }

        if let Ok(val) = std::env::var("STACFORGE_SCENE_TIMEOUT_SECS") {
            config.scene_timeout =
                Duration::from_secs(parse_env_value(&val, "STACFORGE_SCENE_TIMEOUT_SECS")?);
        }

        if let Ok(val) = std::env::var("STACFORGE_RETRY_ATTEMPTS") {
            config.retry_attempts = parse_env_value(&val, "STACFORGE_RETRY_ATTEMPTS")?;
        }

        if let Ok(val) = std::env::var("STACFORGE_RETRY_WAIT_SECS") {
            config.retry_wait =
                Duration::from_secs(parse_env_value(&val, "STACFORGE_RETRY_WAIT_SECS")?);
        }

        if let Ok(val) = std::env::var("STACFORGE_POLL_INTERVAL_SECS") {
            config.poll_interval =
                Duration::from_secs(parse_env_value(&val, "STACFORGE_POLL_INTERVAL_SECS")?);
        }

        if let Ok(val) = std::env::var("STACFORGE_LISTEN_ADDR") {
            config.listen_addr = val;
        }

        if let Ok(val) = std::env::var("STACFORGE_LOG_TABLE") {
            config.log_table_path = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.catalog_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "catalog_url cannot be empty".to_string(),
            ));
        }

        if self.api_version.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_version cannot be empty".to_string(),
            ));
        }

        if self.max_concurrent_scenes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_scenes must be greater than 0".to_string(),
            ));
        }

        if self.scene_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "scene_timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.sas_lifetime <= self.source_refresh_margin {
            return Err(ConfigError::ValidationFailed(
                "sas_lifetime must exceed source_refresh_margin".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the catalog URL.
    pub fn with_catalog_url(mut self, url: impl Into<String>) -> Self {
        self.catalog_url = url.into();
        self
    }

    /// Builder method to set the conflict mode.
    pub fn with_on_conflict(mut self, mode: ConflictMode) -> Self {
        self.on_conflict = mode;
        self
    }

    /// Builder method to set the credential refresh margin.
    pub fn with_source_refresh_margin(mut self, margin: Duration) -> Self {
        self.source_refresh_margin = margin;
        self
    }

    /// Builder method to set the minted SAS lifetime.
    pub fn with_sas_lifetime(mut self, lifetime: Duration) -> Self {
        self.sas_lifetime = lifetime;
        self
    }

    /// Builder method to set the worker pool width.
    pub fn with_max_concurrent_scenes(mut self, max: usize) -> Self {
        self.max_concurrent_scenes = max;
        self
    }

    /// Builder method to set the per-scene timeout.
    pub fn with_scene_timeout(mut self, timeout: Duration) -> Self {
        self.scene_timeout = timeout;
        self
    }

    /// Builder method to set the retry policy.
    pub fn with_retry(mut self, attempts: u32, wait: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_wait = wait;
        self
    }

    /// Builder method to set the operation poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the log table path.
    pub fn with_log_table_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_table_path = Some(path.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

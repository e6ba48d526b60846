//! Blob storage access.
//!
//! [`ObjectStore`] is the seam between the pipeline and a storage
//! container: listing (flat and delimiter-based), download, upload, and
//! minting of time-limited signed-access (SAS) credentials. The
//! production implementation speaks the blob REST API
//! ([`azure::AzureBlobStore`]); tests use [`MemoryStore`].

mod azure;

pub use azure::AzureBlobStore;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::error::StorageError;

/// Permissions requested for a minted SAS credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct SasPermissions {
    pub read: bool,
    pub write: bool,
    pub delete: bool,
    pub list: bool,
}

impl SasPermissions {
    pub fn read_list() -> Self {
        Self {
            read: true,
            list: true,
            ..Self::default()
        }
    }

    /// Permission string in canonical order.
    pub fn as_str(&self) -> String {
        let mut s = String::new();
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.delete {
            s.push('d');
        }
        if self.list {
            s.push('l');
        }
        s
    }
}

/// Access to one storage container.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Base URL of the container, without trailing slash.
    fn container_url(&self) -> String;

    /// Lists blob URLs under `prefix`, filtered by a glob `pattern`
    /// applied to the blob name.
    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Vec<String>, StorageError>;

    /// Lists common prefixes ("directories") under `prefix`, as URLs
    /// without the trailing delimiter.
    async fn list_prefixes(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError>;

    /// Downloads one blob by name.
    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Uploads one blob, overwriting any existing content. Returns the
    /// blob URL.
    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<String, StorageError>;

    /// Mints a container SAS credential valid until `expiry`.
    async fn mint_sas(
        &self,
        expiry: DateTime<Utc>,
        permissions: SasPermissions,
    ) -> Result<String, StorageError>;
}

/// Translates a glob pattern into an anchored regex, following fnmatch
/// semantics (`*` crosses path separators, `?` matches one character,
/// `[...]` character classes pass through).
pub fn glob_to_regex(pattern: &str) -> Result<Regex, StorageError> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                out.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    out.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        out.push_str("\\\\");
                    } else {
                        out.push(inner);
                    }
                }
                out.push(']');
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|_| StorageError::InvalidPattern(pattern.to_string()))
}

/// In-memory store used by tests.
pub struct MemoryStore {
    container_url: String,
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
    /// Number of SAS credentials minted, for lifecycle assertions.
    pub minted: AtomicU64,
}

impl MemoryStore {
    pub fn new(container_url: impl Into<String>) -> Self {
        Self {
            container_url: container_url.into(),
            blobs: Mutex::new(BTreeMap::new()),
            minted: AtomicU64::new(0),
        }
    }

    pub fn insert(&self, name: &str, data: impl Into<Vec<u8>>) {
        self.blobs
            .lock()
            .expect("store poisoned")
            .insert(name.to_string(), data.into());
    }

    pub fn minted_count(&self) -> u64 {
        self.minted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn container_url(&self) -> String {
        self.container_url.clone()
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Vec<String>, StorageError> {
        let regex = pattern.map(glob_to_regex).transpose()?;
        let blobs = self.blobs.lock().expect("store poisoned");
        Ok(blobs
            .keys()
            .filter(|name| prefix.map_or(true, |p| name.starts_with(p)))
            .filter(|name| regex.as_ref().map_or(true, |r| r.is_match(name)))
            .map(|name| format!("{}/{}", self.container_url, name))
            .collect())
    }

    async fn list_prefixes(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let base = prefix.unwrap_or("");
        let blobs = self.blobs.lock().expect("store poisoned");
        let mut prefixes: Vec<String> = Vec::new();
        for name in blobs.keys() {
            if let Some(rest) = name.strip_prefix(base) {
                if let Some(pos) = rest.find('/') {
                    let dir = format!("{}{}", base, &rest[..pos]);
                    let url = format!("{}/{}", self.container_url, dir);
                    if !prefixes.contains(&url) {
                        prefixes.push(url);
                    }
                }
            }
        }
        Ok(prefixes)
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let blobs = self.blobs.lock().expect("store poisoned");
        blobs
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<String, StorageError> {
        self.insert(name, data);
        Ok(format!("{}/{}", self.container_url, name))
    }

    async fn mint_sas(
        &self,
        expiry: DateTime<Utc>,
        permissions: SasPermissions,
    ) -> Result<String, StorageError> {
        self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "sv=test&sp={}&se={}&sig=memory",
            permissions.as_str(),
            expiry.to_rfc3339()
        ))
    }
}

/// Splits a container URL into (account, container) components.
pub fn parse_container_url(url: &str) -> Result<(String, String), StorageError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
    let (host, path) = rest
        .split_once('/')
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
    let account = host
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
    let container = path
        .split('/')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StorageError::InvalidUrl(url.to_string()))?;
    Ok((account.to_string(), container.to_string()))
}

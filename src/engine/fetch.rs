//! Remote resource access for template functions.
//!
//! Rendering runs on blocking worker threads, so the fetcher is
//! synchronous. [`HttpFetcher`] retries transient failures with a fixed
//! wait, mirroring the submission retry policy; [`MemoryFetcher`] backs
//! the tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::EngineError;

/// Reads remote resources referenced from templates.
pub trait BlobFetcher: Send + Sync {
    /// Downloads the full resource at `url`.
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError>;

    /// Downloads `length` bytes starting at `offset`.
    fn fetch_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>, EngineError>;
}

/// HTTP fetcher used in production.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    attempts: u32,
    wait: Duration,
}

impl HttpFetcher {
    pub fn new(attempts: u32, wait: Duration) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            attempts: attempts.max(1),
            wait,
        }
    }

    fn get(&self, url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>, EngineError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_once(url, range) {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(%url, attempt, error = %e, "resource fetch failed, retrying");
                    std::thread::sleep(self.wait);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn get_once(&self, url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>, EngineError> {
        let mut request = self.client.get(url);
        if let Some((offset, length)) = range {
            request = request.header(
                reqwest::header::RANGE,
                format!("bytes={}-{}", offset, offset + length - 1),
            );
        }
        debug!(%url, ?range, "fetching resource");
        let response = request
            .send()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(EngineError::ResourceNotFound(url.to_string()));
        }
        if !status.is_success() {
            let message = response.text().unwrap_or_default();
            return Err(EngineError::Service {
                status: status.as_u16(),
                message,
            });
        }
        let bytes = response
            .bytes()
            .map_err(|e| EngineError::Transport(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl BlobFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        self.get(url, None)
    }

    fn fetch_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>, EngineError> {
        self.get(url, Some((offset, length)))
    }
}

/// In-memory fetcher used by tests.
#[derive(Default)]
pub struct MemoryFetcher {
    resources: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, data: impl Into<Vec<u8>>) {
        self.resources
            .lock()
            .expect("fetcher poisoned")
            .insert(url.to_string(), data.into());
    }
}

impl BlobFetcher for MemoryFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        self.resources
            .lock()
            .expect("fetcher poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::ResourceNotFound(url.to_string()))
    }

    fn fetch_range(&self, url: &str, offset: u64, length: u64) -> Result<Vec<u8>, EngineError> {
        let all = self.fetch(url)?;
        let start = offset as usize;
        if start >= all.len() {
            return Err(EngineError::InvalidArgument(format!(
                "range start {offset} beyond resource of {} bytes",
                all.len()
            )));
        }
        let end = (start + length as usize).min(all.len());
        Ok(all[start..end].to_vec())
    }
}

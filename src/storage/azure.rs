//! Blob REST API implementation of [`ObjectStore`].
//!
//! Listing uses the container REST surface (`restype=container&comp=list`)
//! which returns XML; SAS credentials are service SAS tokens signed with
//! the shared account key. Transient service failures (5xx, 408, 429) are
//! retried with a fixed wait.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use sha2::Sha256;

use super::{glob_to_regex, ObjectStore, SasPermissions};
use crate::error::StorageError;
use crate::retry::RetryPolicy;

const SAS_VERSION: &str = "2022-11-02";

/// Store backed by the blob REST API.
pub struct AzureBlobStore {
    account: String,
    container: String,
    endpoint_suffix: String,
    /// Base64 shared key for SAS signing, when available.
    account_key: Option<String>,
    /// SAS query string appended to data-plane requests, when the
    /// container is not public.
    sas_query: Option<String>,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl AzureBlobStore {
    pub fn new(
        account: impl Into<String>,
        container: impl Into<String>,
        endpoint_suffix: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            account: account.into(),
            container: container.into(),
            endpoint_suffix: endpoint_suffix.into(),
            account_key: None,
            sas_query: None,
            client: reqwest::Client::new(),
            retry,
        }
    }

    /// Attaches the shared account key used for SAS minting.
    pub fn with_account_key(mut self, key: impl Into<String>) -> Self {
        self.account_key = Some(key.into());
        self
    }

    /// Attaches a SAS query string for data-plane access.
    pub fn with_sas_query(mut self, sas: impl Into<String>) -> Self {
        self.sas_query = Some(sas.into());
        self
    }

    fn base_url(&self) -> String {
        format!(
            "https://{}.{}/{}",
            self.account, self.endpoint_suffix, self.container
        )
    }

    fn with_credential(&self, url: String) -> String {
        match &self.sas_query {
            Some(sas) => {
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}{sas}")
            }
            None => url,
        }
    }

    async fn get_raw(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let authed = self.with_credential(url.to_string());
        self.retry
            .run(
                || async {
                    let response = self
                        .client
                        .get(&authed)
                        .send()
                        .await
                        .map_err(|e| StorageError::Request(e.to_string()))?;
                    let status = response.status();
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(StorageError::NotFound(url.to_string()));
                    }
                    if !status.is_success() {
                        let message = response.text().await.unwrap_or_default();
                        return Err(StorageError::Service {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    let bytes = response
                        .bytes()
                        .await
                        .map_err(|e| StorageError::Request(e.to_string()))?;
                    Ok(bytes.to_vec())
                },
                StorageError::is_transient,
            )
            .await
    }

    /// Walks paginated list responses, collecting `<Blob><Name>` or
    /// `<BlobPrefix><Name>` entries.
    async fn list(
        &self,
        prefix: Option<&str>,
        delimiter: Option<&str>,
    ) -> Result<(Vec<String>, Vec<String>), StorageError> {
        let mut blobs = Vec::new();
        let mut prefixes = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut url = format!("{}?restype=container&comp=list", self.base_url());
            if let Some(p) = prefix {
                url.push_str(&format!("&prefix={}", urlencoding::encode(p)));
            }
            if let Some(d) = delimiter {
                url.push_str(&format!("&delimiter={}", urlencoding::encode(d)));
            }
            if let Some(m) = &marker {
                url.push_str(&format!("&marker={}", urlencoding::encode(m)));
            }

            let body = self.get_raw(&url).await?;
            let page = parse_list_page(&body)?;
            blobs.extend(page.blobs);
            prefixes.extend(page.prefixes);

            match page.next_marker {
                Some(m) if !m.is_empty() => marker = Some(m),
                _ => break,
            }
        }

        Ok((blobs, prefixes))
    }
}

#[async_trait]
impl ObjectStore for AzureBlobStore {
    fn container_url(&self) -> String {
        self.base_url()
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Vec<String>, StorageError> {
        let regex = pattern.map(glob_to_regex).transpose()?;
        let (names, _) = self.list(prefix, None).await?;
        Ok(names
            .into_iter()
            .filter(|name| regex.as_ref().map_or(true, |r| r.is_match(name)))
            .map(|name| format!("{}/{}", self.base_url(), name))
            .collect())
    }

    async fn list_prefixes(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let (_, prefixes) = self.list(prefix, Some("/")).await?;
        Ok(prefixes
            .into_iter()
            .map(|p| format!("{}/{}", self.base_url(), p.trim_end_matches('/')))
            .collect())
    }

    async fn download(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}/{}", self.base_url(), name);
        self.get_raw(&url).await
    }

    async fn upload(&self, name: &str, data: Vec<u8>) -> Result<String, StorageError> {
        let url = format!("{}/{}", self.base_url(), name);
        let authed = self.with_credential(url.clone());
        self.retry
            .run(
                || {
                    let body = data.clone();
                    let authed = authed.clone();
                    async move {
                        let response = self
                            .client
                            .put(&authed)
                            .header("x-ms-blob-type", "BlockBlob")
                            .body(body)
                            .send()
                            .await
                            .map_err(|e| StorageError::Request(e.to_string()))?;
                        let status = response.status();
                        if !status.is_success() {
                            let message = response.text().await.unwrap_or_default();
                            return Err(StorageError::Service {
                                status: status.as_u16(),
                                message,
                            });
                        }
                        Ok(())
                    }
                },
                StorageError::is_transient,
            )
            .await?;
        Ok(url)
    }

    async fn mint_sas(
        &self,
        expiry: DateTime<Utc>,
        permissions: SasPermissions,
    ) -> Result<String, StorageError> {
        let key = self
            .account_key
            .as_ref()
            .ok_or_else(|| StorageError::SasMint("no account key configured".to_string()))?;

        // Start five minutes in the past to absorb clock skew.
        let start = Utc::now() - chrono::Duration::minutes(5);
        sign_container_sas(
            &self.account,
            &self.container,
            key,
            start,
            expiry,
            &permissions.as_str(),
        )
    }
}

struct ListPage {
    blobs: Vec<String>,
    prefixes: Vec<String>,
    next_marker: Option<String>,
}

/// Parses one page of a container list response.
fn parse_list_page(body: &[u8]) -> Result<ListPage, StorageError> {
    let text =
        std::str::from_utf8(body).map_err(|e| StorageError::ListingParse(e.to_string()))?;
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);

    let mut blobs = Vec::new();
    let mut prefixes = Vec::new();
    let mut next_marker = None;

    // Track the element path so <Name> is attributed to Blob vs BlobPrefix.
    let mut path: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| StorageError::ListingParse(e.to_string()))?
        {
            Event::Start(e) => {
                path.push(String::from_utf8_lossy(e.name().as_ref()).to_string());
            }
            Event::End(_) => {
                path.pop();
            }
            Event::Text(t) => {
                let value = t
                    .unescape()
                    .map_err(|e| StorageError::ListingParse(e.to_string()))?
                    .to_string();
                match path.as_slice() {
                    [.., parent, last] if last == "Name" && parent == "Blob" => {
                        blobs.push(value);
                    }
                    [.., parent, last] if last == "Name" && parent == "BlobPrefix" => {
                        prefixes.push(value);
                    }
                    [.., last] if last == "NextMarker" => next_marker = Some(value),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(ListPage {
        blobs,
        prefixes,
        next_marker,
    })
}

/// Builds and signs a service SAS token for a container.
fn sign_container_sas(
    account: &str,
    container: &str,
    account_key: &str,
    start: DateTime<Utc>,
    expiry: DateTime<Utc>,
    permissions: &str,
) -> Result<String, StorageError> {
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(account_key)
        .map_err(|e| StorageError::SasMint(format!("invalid account key: {e}")))?;

    let start_s = start.to_rfc3339_opts(SecondsFormat::Secs, true);
    let expiry_s = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
    let canonical = format!("/blob/{account}/{container}");

    // Service SAS string-to-sign, blob service.
    let string_to_sign = format!(
        "{permissions}\n{start_s}\n{expiry_s}\n{canonical}\n\n\nhttps\n{SAS_VERSION}\nc\n\n\n\n\n\n"
    );

    let mut mac = Hmac::<Sha256>::new_from_slice(&key_bytes)
        .map_err(|e| StorageError::SasMint(e.to_string()))?;
    mac.update(string_to_sign.as_bytes());
    let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!(
        "sv={}&sr=c&sp={}&st={}&se={}&spr=https&sig={}",
        SAS_VERSION,
        permissions,
        urlencoding::encode(&start_s),
        urlencoding::encode(&expiry_s),
        urlencoding::encode(&signature)
    ))
}

//! Remote provider adapter (spec §4.9, component C9): the narrow,
//! vendor-agnostic capability surface the rest of the remote tier (C5)
//! is built against — entry lookup, entry creation, and (folded onto the
//! upload session an entry-creation returns) entry finalisation. Two
//! concrete providers are supplied: a CI-provider-managed signed-URL
//! catalog (the primary, default path for a hosted CI job) and a direct
//! S3-compatible client. The exact wire format of either exchange is an
//! external contract we're free to choose; both choices are recorded in
//! DESIGN.md.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;
use url::Url;

pub type BoxAsyncRead = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("remote provider returned an unexpected response: {0}")]
    Protocol(String),
}

/// Obtained from a successful [`RemoteProvider::lookup_entry`]: reads of
/// the single RemoteBundle object the entry points to.
#[async_trait]
pub trait DownloadClient: Send + Sync {
    /// The object's own URL (used by the uploader to stage a
    /// server-side block-copy of the base bundle; spec §4.5.2).
    fn object_url(&self) -> &Url;

    /// Reads exactly `len` bytes starting at `offset` into memory.
    async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, ProviderError>;

    /// Streams `len` bytes starting at `offset` without buffering the
    /// whole range in memory (spec §1: "stream large output payloads").
    async fn stream_range(&self, offset: u64, len: u64) -> Result<BoxAsyncRead, ProviderError>;
}

/// Obtained from a successful [`RemoteProvider::create_entry`]: the
/// block-granular upload session for one new RemoteBundle.
#[async_trait]
pub trait UploadClient: Send + Sync {
    /// Stages `len` bytes read from `body` under `block_id`.
    async fn stage_block(
        &self,
        block_id: &str,
        len: u64,
        body: BoxAsyncRead,
    ) -> Result<(), ProviderError>;

    /// Stages `size` bytes of `source_url` (at `offset`) under
    /// `block_id` via a server-side copy when the provider supports one;
    /// falls back to downloading and re-staging otherwise (spec §9
    /// "Bundle copy on upload").
    async fn stage_block_from_url(
        &self,
        block_id: &str,
        source_url: &Url,
        offset: u64,
        size: u64,
    ) -> Result<(), ProviderError>;

    /// Commits the object from exactly the given ordered block IDs.
    async fn commit(&self, block_ids: &[String]) -> Result<(), ProviderError>;

    /// Marks the entry complete at `total_size` bytes (spec §4.9 "entry
    /// finalisation"), once `commit` has succeeded.
    async fn finalize(&self, total_size: u64) -> Result<(), ProviderError>;
}

/// The narrow capability surface a remote storage backend must provide
/// (spec §4.9). A single process uses exactly one implementation,
/// selected by configuration (spec §6 "remote mode").
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Looks up `primary_key`, falling back in order through
    /// `fallback_keys`, at the given cache-format `version`. `Ok(None)`
    /// means "not found" (not an error); see spec §7's distinction
    /// between "remote fetch failed" and "remote says absent".
    async fn lookup_entry(
        &self,
        primary_key: &str,
        fallback_keys: &[String],
        version: &str,
    ) -> Result<Option<Box<dyn DownloadClient>>, ProviderError>;

    /// Reserves a new entry at `key`/`version` for upload. `Ok(None)`
    /// means the provider refused (e.g. a conflicting reservation);
    /// treated the same as a non-fatal remote failure by the caller.
    async fn create_entry(
        &self,
        key: &str,
        version: &str,
    ) -> Result<Option<Box<dyn UploadClient>>, ProviderError>;
}

/// Derives the primary cache key and its restore (fallback) keys (spec
/// §4.9): `prefix + OS + suffix`, where suffix ranges from the most
/// specific (`/ref/sha`) down to none at all. Restore keys are yielded
/// most-specific-first (Open Question (a) in spec §9: we fix this order
/// since the original varies across revisions — see DESIGN.md).
pub fn cache_keys(prefix: &str, os: &str, git_ref: Option<&str>, sha: Option<&str>) -> (String, Vec<String>) {
    let base = format!("{prefix}{os}");
    let mut candidates = vec![base.clone()];
    if let Some(r) = git_ref {
        candidates.push(format!("{base}/{r}"));
        if let Some(s) = sha {
            candidates.push(format!("{base}/{r}/{s}"));
        }
    }
    candidates.reverse();
    let primary = candidates.remove(0);
    (primary, candidates)
}

/// A fixed 64-hex-character version/namespace string derived from a
/// constant domain tag (spec §4.9): bump `domain_tag` to evolve the wire
/// format without colliding with caches from an older GoCICa.
pub fn version_tag(domain_tag: &str) -> String {
    hex::encode(Sha256::digest(domain_tag.as_bytes()))
}

pub const DEFAULT_DOMAIN_TAG: &str = "gocica-remote-bundle-v1";

// ---------------------------------------------------------------------
// CI-provider adapter: a signed-URL catalog reached over HTTP, modelled
// on the shape of a hosted CI provider's own artifact-cache service
// (reserve an entry, stage blocks against a block-blob-style signed
// URL, commit, finalize).
// ---------------------------------------------------------------------

pub struct CiProviderClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
}

impl CiProviderClient {
    pub fn new(base_url: Url, token: String) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gocica/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(CiProviderClient {
            http,
            base_url,
            token,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        self.base_url
            .join(path)
            .expect("path segments are static and valid")
    }
}

#[derive(Serialize)]
struct LookupQuery<'a> {
    keys: String,
    version: &'a str,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(rename = "archiveLocation")]
    archive_location: String,
}

#[derive(Serialize)]
struct ReserveRequest<'a> {
    key: &'a str,
    version: &'a str,
}

#[derive(Deserialize)]
struct ReserveResponse {
    #[serde(rename = "cacheId")]
    cache_id: i64,
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

#[async_trait]
impl RemoteProvider for CiProviderClient {
    async fn lookup_entry(
        &self,
        primary_key: &str,
        fallback_keys: &[String],
        version: &str,
    ) -> Result<Option<Box<dyn DownloadClient>>, ProviderError> {
        let mut keys = vec![primary_key.to_string()];
        keys.extend_from_slice(fallback_keys);

        let resp = self
            .http
            .get(self.endpoint("cache"))
            .bearer_auth(&self.token)
            .query(&LookupQuery {
                keys: keys.join(","),
                version,
            })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let body: LookupResponse = resp.json().await?;
        let url = Url::parse(&body.archive_location)?;

        Ok(Some(Box::new(CiDownloadClient {
            http: self.http.clone(),
            url,
        })))
    }

    async fn create_entry(
        &self,
        key: &str,
        version: &str,
    ) -> Result<Option<Box<dyn UploadClient>>, ProviderError> {
        let resp = self
            .http
            .post(self.endpoint("caches"))
            .bearer_auth(&self.token)
            .json(&ReserveRequest { key, version })
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let body: ReserveResponse = resp.json().await?;
        let upload_url = Url::parse(&body.upload_url)?;

        Ok(Some(Box::new(CiUploadClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            cache_id: body.cache_id,
            upload_url,
        })))
    }
}

struct CiDownloadClient {
    http: reqwest::Client,
    url: Url,
}

#[async_trait]
impl DownloadClient for CiDownloadClient {
    fn object_url(&self) -> &Url {
        &self.url
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, ProviderError> {
        let end = offset + len.saturating_sub(1).max(0);
        let resp = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn stream_range(&self, offset: u64, len: u64) -> Result<BoxAsyncRead, ProviderError> {
        let end = offset + len.saturating_sub(1).max(0);
        let resp = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
    }
}

struct CiUploadClient {
    http: reqwest::Client,
    base_url: Url,
    token: String,
    cache_id: i64,
    upload_url: Url,
}

impl CiUploadClient {
    fn block_url(&self, block_id: &str) -> Url {
        let mut url = self.upload_url.clone();
        url.query_pairs_mut()
            .append_pair("comp", "block")
            .append_pair("blockid", block_id);
        url
    }

    fn block_list_url(&self) -> Url {
        let mut url = self.upload_url.clone();
        url.query_pairs_mut().append_pair("comp", "blocklist");
        url
    }
}

#[async_trait]
impl UploadClient for CiUploadClient {
    async fn stage_block(
        &self,
        block_id: &str,
        len: u64,
        body: BoxAsyncRead,
    ) -> Result<(), ProviderError> {
        let stream = tokio_util::io::ReaderStream::new(body);
        self.http
            .put(self.block_url(block_id))
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn stage_block_from_url(
        &self,
        block_id: &str,
        source_url: &Url,
        offset: u64,
        size: u64,
    ) -> Result<(), ProviderError> {
        let end = offset + size.saturating_sub(1).max(0);
        self.http
            .put(self.block_url(block_id))
            .header("x-ms-copy-source", source_url.as_str())
            .header("x-ms-source-range", format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn commit(&self, block_ids: &[String]) -> Result<(), ProviderError> {
        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for id in block_ids {
            body.push_str(&format!("<Latest>{id}</Latest>"));
        }
        body.push_str("</BlockList>");

        self.http
            .put(self.block_list_url())
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn finalize(&self, total_size: u64) -> Result<(), ProviderError> {
        #[derive(Serialize)]
        struct FinalizeRequest {
            size: u64,
        }
        self.http
            .post(
                self.base_url
                    .join(&format!("caches/{}/finalize", self.cache_id))?,
            )
            .bearer_auth(&self.token)
            .json(&FinalizeRequest { size: total_size })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// S3-like adapter: a direct multipart upload / ranged GET against any
// S3-compatible endpoint. Has no server-side "copy from an arbitrary
// URL" primitive, so `stage_block_from_url` falls back to downloading
// and re-staging the range (spec §9 "Bundle copy on upload": "An
// implementation without a server-side copy must fall back to
// re-uploading").
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: Url,
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub path_style: bool,
}

pub struct S3LikeClient {
    http: reqwest::Client,
    config: S3Config,
}

impl S3LikeClient {
    pub fn new(config: S3Config) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("gocica/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(S3LikeClient { http, config })
    }

    fn object_url(&self, key: &str) -> Url {
        if self.config.path_style {
            let mut url = self.config.endpoint.clone();
            url.set_path(&format!("/{}/{}", self.config.bucket, key));
            url
        } else {
            let mut url = self.config.endpoint.clone();
            let host = format!("{}.{}", self.config.bucket, url.host_str().unwrap_or(""));
            url.set_host(Some(&host)).ok();
            url.set_path(&format!("/{}", key));
            url
        }
    }

    fn credentials(&self) -> super::sigv4::S3Credentials {
        super::sigv4::S3Credentials {
            access_key: self.config.access_key.clone(),
            secret_key: self.config.secret_key.clone(),
            region: self.config.region.clone(),
        }
    }
}

#[async_trait]
impl RemoteProvider for S3LikeClient {
    async fn lookup_entry(
        &self,
        primary_key: &str,
        fallback_keys: &[String],
        _version: &str,
    ) -> Result<Option<Box<dyn DownloadClient>>, ProviderError> {
        for key in std::iter::once(primary_key).chain(fallback_keys.iter().map(String::as_str)) {
            let url = self.object_url(key);
            let resp = self.http.head(url.clone()).send().await?;
            if resp.status().is_success() {
                return Ok(Some(Box::new(S3DownloadClient {
                    http: self.http.clone(),
                    url,
                })));
            }
        }
        Ok(None)
    }

    async fn create_entry(
        &self,
        key: &str,
        _version: &str,
    ) -> Result<Option<Box<dyn UploadClient>>, ProviderError> {
        let url = self.object_url(key);
        let mut initiate_url = url.clone();
        initiate_url.query_pairs_mut().append_pair("uploads", "");

        let now = time::OffsetDateTime::now_utc();
        let creds = self.credentials();
        let host = url.host_str().unwrap_or("").to_string();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("host".to_string(), host);
        let payload_hash = hex::encode(sha2::Sha256::digest(b""));
        let (auth, amz_date) = super::sigv4::sign_headers(
            &creds,
            "POST",
            initiate_url.path(),
            &headers,
            &payload_hash,
            now,
        );

        let resp = self
            .http
            .post(initiate_url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .send()
            .await?
            .error_for_status()?;
        let xml = resp.text().await?;
        let upload_id = extract_xml_tag(&xml, "UploadId")
            .ok_or_else(|| ProviderError::Protocol("missing UploadId in InitiateMultipartUpload response".into()))?;

        Ok(Some(Box::new(S3UploadClient {
            http: self.http.clone(),
            creds,
            url,
            upload_id,
            next_part_number: Arc::new(AtomicU64::new(1)),
            parts: Arc::new(tokio::sync::Mutex::new(Vec::new())),
            block_to_part: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
        })))
    }
}

struct S3DownloadClient {
    http: reqwest::Client,
    url: Url,
}

#[async_trait]
impl DownloadClient for S3DownloadClient {
    fn object_url(&self) -> &Url {
        &self.url
    }

    async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>, ProviderError> {
        let end = offset + len.saturating_sub(1).max(0);
        let resp = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn stream_range(&self, offset: u64, len: u64) -> Result<BoxAsyncRead, ProviderError> {
        let end = offset + len.saturating_sub(1).max(0);
        let resp = self
            .http
            .get(self.url.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
    }
}

struct S3UploadClient {
    http: reqwest::Client,
    creds: super::sigv4::S3Credentials,
    url: Url,
    upload_id: String,
    next_part_number: Arc<AtomicU64>,
    parts: Arc<tokio::sync::Mutex<Vec<(u64, String)>>>, // (part number, etag)
    block_to_part: Arc<tokio::sync::Mutex<std::collections::HashMap<String, u64>>>,
}

impl S3UploadClient {
    async fn part_number_for(&self, block_id: &str) -> u64 {
        let mut map = self.block_to_part.lock().await;
        *map.entry(block_id.to_string())
            .or_insert_with(|| self.next_part_number.fetch_add(1, Ordering::SeqCst))
    }

    fn sign(&self, method: &str, query: &str) -> (Url, String, String, String) {
        let mut url = self.url.clone();
        url.set_query(Some(query));
        let now = time::OffsetDateTime::now_utc();
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("host".to_string(), url.host_str().unwrap_or("").to_string());
        let payload_hash = hex::encode(sha2::Sha256::digest(b""));
        let (auth, amz_date) =
            super::sigv4::sign_headers(&self.creds, method, url.path(), &headers, &payload_hash, now);
        (url, auth, amz_date, payload_hash)
    }
}

#[async_trait]
impl UploadClient for S3UploadClient {
    async fn stage_block(
        &self,
        block_id: &str,
        len: u64,
        body: BoxAsyncRead,
    ) -> Result<(), ProviderError> {
        let part_number = self.part_number_for(block_id).await;
        let query = format!("partNumber={part_number}&uploadId={}", self.upload_id);
        let (url, auth, amz_date, payload_hash) = self.sign("PUT", &query);

        let stream = tokio_util::io::ReaderStream::new(body);
        let resp = self
            .http
            .put(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?;

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.parts.lock().await.push((part_number, etag));
        Ok(())
    }

    async fn stage_block_from_url(
        &self,
        block_id: &str,
        source_url: &Url,
        offset: u64,
        size: u64,
    ) -> Result<(), ProviderError> {
        // No server-side "copy from arbitrary URL" in plain S3: download
        // the range and re-stage it as an ordinary part (spec §9).
        let end = offset + size.saturating_sub(1).max(0);
        let resp = self
            .http
            .get(source_url.clone())
            .header(reqwest::header::RANGE, format!("bytes={offset}-{end}"))
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        let len = bytes.len() as u64;
        let reader: BoxAsyncRead = Box::pin(std::io::Cursor::new(bytes.to_vec()));
        self.stage_block(block_id, len, reader).await
    }

    async fn commit(&self, block_ids: &[String]) -> Result<(), ProviderError> {
        let parts = self.parts.lock().await;
        let mut numbered: Vec<(u64, String)> = Vec::with_capacity(block_ids.len());
        let block_to_part = self.block_to_part.lock().await;
        for id in block_ids {
            let Some(part_number) = block_to_part.get(id) else {
                continue; // zero-size outputs contribute no block (spec §4.5.2)
            };
            let etag = parts
                .iter()
                .find(|(n, _)| n == part_number)
                .map(|(_, e)| e.clone())
                .unwrap_or_default();
            numbered.push((*part_number, etag));
        }
        numbered.sort_by_key(|(n, _)| *n);

        let mut body = String::from("<CompleteMultipartUpload>");
        for (n, etag) in &numbered {
            body.push_str(&format!("<Part><PartNumber>{n}</PartNumber><ETag>{etag}</ETag></Part>"));
        }
        body.push_str("</CompleteMultipartUpload>");

        let query = format!("uploadId={}", self.upload_id);
        let (url, auth, amz_date, payload_hash) = self.sign("POST", &query);
        self.http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, auth)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn finalize(&self, _total_size: u64) -> Result<(), ProviderError> {
        // CompleteMultipartUpload already finalized the object; S3 has no
        // separate finalisation step.
        Ok(())
    }
}

fn extract_xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].to_string())
}

use futures::StreamExt;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_are_most_specific_first() {
        let (primary, fallbacks) = cache_keys("gocica-", "linux", Some("main"), Some("abc123"));
        assert_eq!(primary, "gocica-linux/main/abc123");
        assert_eq!(fallbacks, vec!["gocica-linux/main", "gocica-linux"]);
    }

    #[test]
    fn cache_keys_without_ref_has_no_fallbacks() {
        let (primary, fallbacks) = cache_keys("gocica-", "linux", None, None);
        assert_eq!(primary, "gocica-linux");
        assert!(fallbacks.is_empty());
    }

    #[test]
    fn version_tag_is_64_hex_chars() {
        let v = version_tag(DEFAULT_DOMAIN_TAG);
        assert_eq!(v.len(), 64);
        assert!(v.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn extracts_upload_id_from_xml() {
        let xml = "<InitiateMultipartUploadResult><UploadId>abc-123</UploadId></InitiateMultipartUploadResult>";
        assert_eq!(extract_xml_tag(xml, "UploadId").as_deref(), Some("abc-123"));
    }
}

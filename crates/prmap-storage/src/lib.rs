//! Download directory + HTTP payload sources for prmap.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use prmap_core::SourceKind;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prmap-storage";

/// One payload to resolve: where it lives in the download directory and where it comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadRequest {
    pub key: String,
    pub url: String,
}

impl PayloadRequest {
    pub fn new(key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
        }
    }

    pub fn for_event(event_id: &str, kind: SourceKind, url: impl Into<String>) -> Self {
        Self::new(format!("parkrun/{event_id}/{}", kind.as_str()), url)
    }

    pub fn is_gzip(&self) -> bool {
        self.key.ends_with(".gz")
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("payload {key} not available offline")]
    Missing { key: String },
    #[error("io error for payload {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// "Fetch bytes for this payload, or fail". Implementations return decoded bytes.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    async fn fetch(&self, request: &PayloadRequest) -> Result<Vec<u8>, FetchError>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes)?;
    encoder.finish()
}

#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Payload files below a root directory, written atomically via temp-file rename.
#[derive(Debug, Clone)]
pub struct DownloadDir {
    root: PathBuf,
}

impl DownloadDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Age of the stored payload, `None` if it does not exist yet.
    pub async fn age(&self, key: &str) -> Option<Duration> {
        let meta = fs::metadata(self.path_for(key)).await.ok()?;
        let modified = meta.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    /// Read and, for `.gz` keys, decompress a stored payload.
    pub async fn read(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        let path = self.path_for(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::Missing {
                    key: key.to_string(),
                })
            }
            Err(source) => {
                return Err(FetchError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        };
        if key.ends_with(".gz") {
            gunzip(&raw).map_err(|source| FetchError::Io {
                key: key.to_string(),
                source,
            })
        } else {
            Ok(raw)
        }
    }

    /// Store decoded bytes, compressing `.gz` keys, replacing any previous payload.
    pub async fn store(&self, key: &str, bytes: &[u8]) -> anyhow::Result<StoredPayload> {
        let path = self.path_for(key);
        let encoded = if key.ends_with(".gz") {
            gzip(bytes).with_context(|| format!("compressing payload {key}"))?
        } else {
            bytes.to_vec()
        };

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating payload directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), encoded.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(&encoded)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp payload {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }

        Ok(StoredPayload {
            content_hash: sha256_hex(bytes),
            path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across clones of one `HttpFetcher`. A sync run
    /// fetches events one after another, so this only bounds callers that
    /// share the fetcher between tasks.
    pub concurrency: usize,
    /// Pause before every request to stay polite towards the upstream sites.
    pub courtesy_delay: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 4,
            courtesy_delay: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    courtesy_delay: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            courtesy_delay: config.courtesy_delay,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut attempt = 0;
        loop {
            tokio::time::sleep(self.courtesy_delay).await;
            debug!(url, attempt, "requesting payload");

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

/// Resolves payloads from the download directory, refreshing over HTTP when a
/// stored copy is missing or older than `max_age`. Without a fetcher it only
/// serves what is already on disk.
#[derive(Debug)]
pub struct DownloadStore {
    dir: DownloadDir,
    http: Option<HttpFetcher>,
    max_age: Duration,
}

impl DownloadStore {
    pub fn offline(root: impl Into<PathBuf>) -> Self {
        Self {
            dir: DownloadDir::new(root),
            http: None,
            max_age: Duration::MAX,
        }
    }

    pub fn online(root: impl Into<PathBuf>, http: HttpFetcher, max_age: Duration) -> Self {
        Self {
            dir: DownloadDir::new(root),
            http: Some(http),
            max_age,
        }
    }

    pub fn dir(&self) -> &DownloadDir {
        &self.dir
    }

    async fn is_fresh(&self, key: &str) -> bool {
        matches!(self.dir.age(key).await, Some(age) if age < self.max_age)
    }
}

#[async_trait]
impl PayloadSource for DownloadStore {
    async fn fetch(&self, request: &PayloadRequest) -> Result<Vec<u8>, FetchError> {
        let Some(http) = &self.http else {
            return self.dir.read(&request.key).await;
        };
        if self.is_fresh(&request.key).await {
            return self.dir.read(&request.key).await;
        }

        let span = info_span!("download", key = %request.key, url = %request.url);
        async {
            let bytes = http.fetch_bytes(&request.url).await?;
            let stored = self
                .dir
                .store(&request.key, &bytes)
                .await
                .map_err(|err| FetchError::Io {
                    key: request.key.clone(),
                    source: std::io::Error::other(format!("{err:#}")),
                })?;
            debug!(hash = %stored.content_hash, bytes = stored.byte_size, "stored payload");
            Ok::<_, FetchError>(bytes)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn payload_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn event_requests_use_per_event_keys() {
        let req = PayloadRequest::for_event("nidda", SourceKind::Kml, "https://example.test/kml");
        assert_eq!(req.key, "parkrun/nidda/kml");
        assert!(!req.is_gzip());
        assert!(PayloadRequest::new("parkrun/events.json.gz", "x").is_gzip());
    }

    #[tokio::test]
    async fn gz_keys_are_compressed_on_disk_and_decoded_on_read() {
        let dir = tempdir().expect("tempdir");
        let store = DownloadDir::new(dir.path());
        let body = br#"{"events":{"features":[]}}"#;

        let stored = store
            .store("parkrun/events.json.gz", body)
            .await
            .expect("store");
        let on_disk = std::fs::read(&stored.path).expect("read raw");
        assert_ne!(on_disk.as_slice(), body.as_slice());
        assert_eq!(gunzip(&on_disk).expect("gunzip"), body.to_vec());

        let read = store.read("parkrun/events.json.gz").await.expect("read");
        assert_eq!(read, body.to_vec());
    }

    #[tokio::test]
    async fn store_replaces_previous_payload() {
        let dir = tempdir().expect("tempdir");
        let store = DownloadDir::new(dir.path());
        store.store("parkrun/a/wiki", b"old").await.expect("first");
        let second = store.store("parkrun/a/wiki", b"new").await.expect("second");
        assert_eq!(second.content_hash, sha256_hex(b"new"));
        assert_eq!(store.read("parkrun/a/wiki").await.expect("read"), b"new".to_vec());
        assert!(store.age("parkrun/a/wiki").await.is_some());
        assert!(store.age("parkrun/b/wiki").await.is_none());
    }

    #[tokio::test]
    async fn offline_store_serves_disk_or_reports_missing() {
        let dir = tempdir().expect("tempdir");
        let source = DownloadStore::offline(dir.path());
        source
            .dir()
            .store("parkrun/nidda/course", b"<html></html>")
            .await
            .expect("seed");

        let hit = PayloadRequest::for_event("nidda", SourceKind::Course, "https://unused.test");
        assert_eq!(source.fetch(&hit).await.expect("hit"), b"<html></html>".to_vec());

        let miss = PayloadRequest::for_event("nidda", SourceKind::Kml, "https://unused.test");
        match source.fetch(&miss).await {
            Err(FetchError::Missing { key }) => assert_eq!(key, "parkrun/nidda/kml"),
            other => panic!("expected missing payload, got {other:?}"),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}

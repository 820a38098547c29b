//! HTTP transport to the deploy agent.
//!
//! Every call carries the bearer token and client id, passes the local
//! throttle, and is retried with exponential backoff when the failure is
//! transient. Transfers are verified against the hash the other side
//! asserts.

use super::progress_stream::{ByteCallback, ProgressStream};
use super::throttle::Throttle;
use crate::config::RemoteConfig;
use crate::error::{ClientError, Result};
use async_compression::tokio::bufread::ZstdEncoder;
use async_compression::Level;
use deploy_core::hash::{is_valid_hash, StreamHasher};
use deploy_core::protocol::{
    ApiResponse, BackupResponse, BatchResponse, DeleteResponse, Encoding, ErrorBody,
    ExtractResponse, HealthResponse, ListResponse, MoveItem, MoveMode, MovedItem, ReadResponse,
    Request, TestResponse, TrashEntry, UploadResponse, WriteResponse, API_PATH, DOWNLOAD_PATH,
    HEADER_CLIENT_ID, HEADER_CONTENT_HASH, HEADER_FILE_SIZE, HEADER_RELATIVE_PATH,
    HEADER_TOTAL_SIZE, HEALTH_PATH, UPLOAD_PATH,
};
use deploy_core::FileIndex;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Body, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

/// Larger files are sent uncompressed
const MAX_COMPRESS_SIZE: u64 = 500 * 1024 * 1024;

/// Throughput floor used to stretch transfer timeouts
const MIN_BYTES_PER_SEC: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// `base_delay × 2^(attempt-1)` for the attempt that just failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// What a verified download produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub hash: String,
    pub size: u64,
}

pub struct TransportClient {
    http: Client,
    base_url: String,
    token: String,
    client_id: String,
    timeout: Duration,
    retry: RetryPolicy,
    throttle: Throttle,
    compression: bool,
}

impl TransportClient {
    pub fn new(remote: &RemoteConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("deploy-client/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: remote.url.trim_end_matches('/').to_string(),
            token: remote.token.clone(),
            client_id: remote.client_id.clone(),
            timeout: Duration::from_secs(remote.timeout_secs.max(1)),
            retry: RetryPolicy {
                max_retries: remote.max_retries,
                base_delay: Duration::from_millis(remote.base_delay_ms),
            },
            throttle: Throttle::per_minute(remote.requests_per_minute),
            compression: remote.compression,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header(HEADER_CLIENT_ID, &self.client_id)
    }

    fn transfer_timeout(&self, size: u64) -> Duration {
        self.timeout + Duration::from_secs(size / MIN_BYTES_PER_SEC)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry.max_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.throttle.acquire().await;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= attempts => return Err(e),
                Err(e) => {
                    let mut delay = self.retry.delay_for(attempt);
                    if let ClientError::RateLimited { retry_after } = &e {
                        delay = delay.max(Duration::from_secs(*retry_after));
                    }
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Pass successful responses through; turn the rest into errors.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok());
        let (message, body_retry) = error_message(response).await;
        Err(ClientError::from_status(status, message, retry_after.or(body_retry)))
    }

    async fn envelope<T: DeserializeOwned>(response: Response) -> Result<T> {
        let envelope: ApiResponse<T> = response.json().await?;
        if !envelope.success {
            return Err(ClientError::Protocol(
                envelope.error.unwrap_or_else(|| "agent reported failure".into()),
            ));
        }
        Ok(envelope.data)
    }

    async fn call_once<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        let response = self
            .authorized(self.http.post(self.url(API_PATH)))
            .timeout(self.timeout)
            .json(request)
            .send()
            .await?;
        Self::envelope(Self::check(response).await?).await
    }

    /// Send one JSON operation, retrying transient failures.
    pub async fn call<T: DeserializeOwned>(&self, request: &Request) -> Result<T> {
        self.with_retry(request.action(), || self.call_once(request))
            .await
    }

    pub async fn test(&self) -> Result<TestResponse> {
        self.call(&Request::Test).await
    }

    /// Agent health. A 503 still carries a valid status body.
    pub async fn health(&self) -> Result<HealthResponse> {
        self.with_retry("health", || self.health_once()).await
    }

    async fn health_once(&self) -> Result<HealthResponse> {
        let response = self
            .authorized(self.http.get(self.url(HEALTH_PATH)))
            .timeout(self.timeout)
            .send()
            .await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Self::envelope(response).await;
        }
        Self::envelope(Self::check(response).await?).await
    }

    /// The remote index, path → record.
    pub async fn list(&self) -> Result<FileIndex> {
        let listing: ListResponse = self.call(&Request::List).await?;
        debug!("Remote lists {} files", listing.count);
        Ok(listing.files)
    }

    pub async fn delete(&self, path: &str, permanent: bool) -> Result<DeleteResponse> {
        self.call(&Request::Delete {
            path: path.to_string(),
            permanent,
        })
        .await
    }

    pub async fn trash(&self, paths: Vec<String>) -> Result<BatchResponse<TrashEntry>> {
        self.call(&Request::Trash { paths }).await
    }

    pub async fn read(&self, path: &str, encoding: Encoding) -> Result<ReadResponse> {
        self.call(&Request::Read {
            path: path.to_string(),
            encoding,
            offset: None,
            lines: None,
        })
        .await
    }

    pub async fn write(&self, path: &str, content: String, encoding: Encoding) -> Result<WriteResponse> {
        self.call(&Request::Write {
            path: path.to_string(),
            content,
            encoding,
            append: false,
        })
        .await
    }

    pub async fn move_items(
        &self,
        items: Vec<MoveItem>,
        mode: MoveMode,
        overwrite: bool,
    ) -> Result<BatchResponse<MovedItem>> {
        self.call(&Request::Move {
            items,
            mode,
            overwrite,
        })
        .await
    }

    pub async fn extract(
        &self,
        path: &str,
        destination: Option<String>,
        overwrite: bool,
    ) -> Result<ExtractResponse> {
        self.call(&Request::Extract {
            path: path.to_string(),
            destination,
            overwrite,
        })
        .await
    }

    pub async fn backup(
        &self,
        paths: Option<Vec<String>>,
        description: Option<String>,
    ) -> Result<BackupResponse> {
        self.call(&Request::Backup { paths, description }).await
    }

    /// Upload `local` as `relative`; the agent must answer with `hash`.
    pub async fn upload(
        &self,
        local: &Path,
        relative: &str,
        hash: &str,
        size: u64,
        on_bytes: Option<ByteCallback>,
    ) -> Result<UploadResponse> {
        let uploaded = self
            .with_retry("upload", || {
                self.upload_once(local, relative, hash, size, on_bytes.clone())
            })
            .await?;

        if uploaded.hash != hash {
            return Err(ClientError::Integrity {
                path: relative.to_string(),
                expected: hash.to_string(),
                actual: uploaded.hash,
            });
        }
        info!("Uploaded {} ({} bytes)", relative, size);
        Ok(uploaded)
    }

    async fn upload_once(
        &self,
        local: &Path,
        relative: &str,
        hash: &str,
        size: u64,
        on_bytes: Option<ByteCallback>,
    ) -> Result<UploadResponse> {
        let file = tokio::fs::File::open(local).await?;
        let callback = on_bytes.unwrap_or_else(|| Arc::new(|_| {}));
        // Counted before compression so progress tracks file bytes
        let counted = ProgressStream::new(ReaderStream::new(file), callback);

        let mut builder = self
            .authorized(self.http.post(self.url(UPLOAD_PATH)))
            .timeout(self.transfer_timeout(size))
            .header(HEADER_RELATIVE_PATH, relative)
            .header(HEADER_CONTENT_HASH, hash)
            .header(HEADER_TOTAL_SIZE, size.to_string())
            .header(CONTENT_TYPE, "application/octet-stream");

        let body = if self.compression && size > 0 && size < MAX_COMPRESS_SIZE {
            builder = builder.header(CONTENT_ENCODING, "zstd");
            let encoder = ZstdEncoder::with_quality(StreamReader::new(counted), Level::Default);
            Body::wrap_stream(ReaderStream::new(encoder))
        } else {
            Body::wrap_stream(counted)
        };

        let response = builder.body(body).send().await?;
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            let (message, _) = error_message(response).await;
            return Err(ClientError::Integrity {
                path: relative.to_string(),
                expected: hash.to_string(),
                actual: message,
            });
        }
        Self::envelope(Self::check(response).await?).await
    }

    /// Download `relative` into `dest`, verifying the asserted hash.
    ///
    /// Bytes land in a temp sibling first; on mismatch it is deleted and
    /// `dest` is left untouched.
    pub async fn download(
        &self,
        relative: &str,
        dest: &Path,
        size_hint: u64,
        on_bytes: Option<ByteCallback>,
    ) -> Result<DownloadedFile> {
        let downloaded = self
            .with_retry("download", || {
                self.download_once(relative, dest, size_hint, on_bytes.clone())
            })
            .await?;
        info!("Downloaded {} ({} bytes)", relative, downloaded.size);
        Ok(downloaded)
    }

    async fn download_once(
        &self,
        relative: &str,
        dest: &Path,
        size_hint: u64,
        on_bytes: Option<ByteCallback>,
    ) -> Result<DownloadedFile> {
        let response = self
            .authorized(self.http.get(self.url(DOWNLOAD_PATH)))
            .query(&[("path", relative)])
            .timeout(self.transfer_timeout(size_hint))
            .send()
            .await?;
        let response = Self::check(response).await?;

        let asserted_hash = response
            .headers()
            .get(HEADER_CONTENT_HASH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase)
            .filter(|h| is_valid_hash(h))
            .ok_or_else(|| {
                ClientError::Protocol(format!("download of {relative} carried no content hash"))
            })?;
        let asserted_size: Option<u64> = response
            .headers()
            .get(HEADER_FILE_SIZE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = temp_sibling(dest);

        let (hash, size) = match receive(response, &temp, on_bytes).await {
            Ok(received) => received,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        if hash != asserted_hash || asserted_size.is_some_and(|expected| expected != size) {
            let _ = tokio::fs::remove_file(&temp).await;
            warn!(
                "Discarded {}: expected {} ({:?} bytes), received {} ({} bytes)",
                relative, asserted_hash, asserted_size, hash, size
            );
            return Err(ClientError::Integrity {
                path: relative.to_string(),
                expected: asserted_hash,
                actual: hash,
            });
        }

        tokio::fs::rename(&temp, dest).await?;
        Ok(DownloadedFile { hash, size })
    }
}

/// Stream a response body to `temp`, hashing as it goes.
async fn receive(
    response: Response,
    temp: &Path,
    on_bytes: Option<ByteCallback>,
) -> Result<(String, u64)> {
    let mut file = tokio::fs::File::create(temp).await?;
    let mut hasher = StreamHasher::new();
    let mut size = 0u64;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
        if let Some(callback) = &on_bytes {
            callback(size);
        }
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((hasher.finish(), size))
}

/// Error text and retry hint from a failed response body.
async fn error_message(response: Response) -> (String, Option<u64>) {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error, body.retry_after),
        Err(_) if text.trim().is_empty() => (status.to_string(), None),
        Err(_) => (text.chars().take(200).collect(), None),
    }
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.part", name, uuid::Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deploy_core::hash::hash_bytes;
    use deploy_core::protocol::HealthStatus;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn remote(server: &MockServer) -> RemoteConfig {
        RemoteConfig {
            url: server.uri(),
            token: "test-token".into(),
            client_id: "tests".into(),
            timeout_secs: 5,
            max_retries: 2,
            base_delay_ms: 1,
            requests_per_minute: 0,
            compression: false,
        }
    }

    fn listing(hash: &str) -> serde_json::Value {
        json!({
            "success": true,
            "count": 1,
            "files": {
                "index.php": { "path": "index.php", "hash": hash, "size": 5, "mtime": 0 }
            }
        })
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "success": false, "error": "Internal server error"
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("x-client-id", "tests"))
            .and(body_partial_json(json!({ "action": "list" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing(&"a".repeat(64))))
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        let index = client.list().await.unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "success": false, "error": "Unauthorized"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        let err = client.test().await.unwrap_err();
        assert!(matches!(err, ClientError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "success": false, "error": "Maintenance mode: deploying"
            })))
            .expect(3)
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        let err = client.list().await.unwrap_err();
        assert!(matches!(err, ClientError::Server { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_rate_limited_then_allowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "0")
                    .set_body_json(json!({ "success": false, "error": "Rate limit exceeded" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "agent_id": "web-1", "version": "1.0.0", "root": "/srv/www"
            })))
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        assert_eq!(client.test().await.unwrap().agent_id, "web-1");
    }

    #[tokio::test]
    async fn test_health_503_is_a_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "success": true,
                "status": "maintenance",
                "version": "1.0.0",
                "uptime_secs": 12,
                "checks": { "root_readable": true },
                "maintenance_message": "migrating"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        let health = client.health().await.unwrap();
        assert_eq!(health.status, HealthStatus::Maintenance);
        assert_eq!(health.maintenance_message.as_deref(), Some("migrating"));
    }

    #[tokio::test]
    async fn test_upload_checks_returned_hash() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("index.php");
        std::fs::write(&local, b"<?php").unwrap();
        let hash = hash_bytes(b"<?php");

        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .and(header("x-relative-path", "index.php"))
            .and(header("x-content-hash", hash.as_str()))
            .and(header("x-total-size", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "path": "index.php", "hash": hash, "size": 5
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true, "path": "index.php", "hash": "b".repeat(64), "size": 5
            })))
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();
        let ok = client.upload(&local, "index.php", &hash, 5, None).await.unwrap();
        assert_eq!(ok.hash, hash);

        let err = client
            .upload(&local, "index.php", &hash, 5, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_upload_rejected_by_agent_is_integrity() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("a.txt");
        std::fs::write(&local, b"abc").unwrap();

        Mock::given(method("POST"))
            .and(path("/api/upload"))
            .and(header("content-encoding", "zstd"))
            .respond_with(ResponseTemplate::new(422).set_body_json(json!({
                "success": false, "error": "Integrity check failed: hash mismatch"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = remote(&server);
        config.compression = true;
        let client = TransportClient::new(&config).unwrap();
        let err = client
            .upload(&local, "a.txt", &hash_bytes(b"abc"), 3, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Integrity { .. }));
    }

    #[tokio::test]
    async fn test_download_verifies_and_discards() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();

        Mock::given(method("GET"))
            .and(path("/api/download"))
            .and(query_param("path", "css/site.css"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-content-hash", hash_bytes(b"body{}").as_str())
                    .insert_header("x-file-size", "6")
                    .set_body_bytes(b"body{}".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/download"))
            .and(query_param("path", "tampered.js"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-content-hash", hash_bytes(b"original").as_str())
                    .set_body_bytes(b"injected".to_vec()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = TransportClient::new(&remote(&server)).unwrap();

        let dest = dir.path().join("css/site.css");
        let file = client.download("css/site.css", &dest, 6, None).await.unwrap();
        assert_eq!(file.size, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"body{}");

        let dest = dir.path().join("tampered.js");
        let err = client
            .download("tampered.js", &dest, 8, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Integrity { .. }));
        assert!(!dest.exists());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

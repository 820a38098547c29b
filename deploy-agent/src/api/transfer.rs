//! Streaming upload and download endpoints.
//!
//! Uploads land in a temp file beside the target while the hash is computed
//! on the decompressed bytes. The target is only replaced once size and hash
//! both match what the client asserted.

use super::AppState;
use crate::fsutil::temp_sibling;
use crate::gateway::ClientIdentity;
use crate::security::ResolvedPath;
use crate::{AgentError, Result};
use async_compression::tokio::bufread::ZstdDecoder;
use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use deploy_core::hash::{hash_file, is_valid_hash, StreamHasher};
use deploy_core::protocol::{
    ApiResponse, UploadResponse, HEADER_CONTENT_HASH, HEADER_FILE_SIZE, HEADER_RELATIVE_PATH,
    HEADER_TOTAL_SIZE,
};
use futures_util::TryStreamExt;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// POST /api/upload - raw (optionally zstd) body
pub async fn upload(
    State(gateway): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
    headers: HeaderMap,
    request: Request,
) -> Result<Response> {
    let relative_path = header_str(&headers, HEADER_RELATIVE_PATH)
        .ok_or_else(|| AgentError::BadRequest(format!("Missing {HEADER_RELATIVE_PATH} header")))?
        .to_string();
    let expected_hash = header_str(&headers, HEADER_CONTENT_HASH)
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| is_valid_hash(h))
        .ok_or_else(|| AgentError::BadRequest(format!("Missing or invalid {HEADER_CONTENT_HASH} header")))?;
    let total_size: u64 = header_str(&headers, HEADER_TOTAL_SIZE)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| AgentError::BadRequest(format!("Missing or invalid {HEADER_TOTAL_SIZE} header")))?;
    let compressed = match header_str(&headers, header::CONTENT_ENCODING.as_str()) {
        None | Some("identity") => false,
        Some("zstd") => true,
        Some(other) => {
            return Err(AgentError::BadRequest(format!("Unsupported content-encoding {other}")))
        }
    };

    let max = gateway.config().security.max_file_size;
    if total_size > max {
        return Err(AgentError::PayloadTooLarge(format!(
            "{relative_path} is {total_size} bytes (max {max})"
        )));
    }

    let target = {
        let gateway = gateway.clone();
        let path = relative_path.clone();
        tokio::task::spawn_blocking(move || -> Result<ResolvedPath> {
            gateway.ensure_writable()?;
            let target = gateway.guard().resolve_entry(&path)?;
            if target.absolute.is_dir() {
                return Err(AgentError::Conflict(format!("{} is a directory", target.relative)));
            }
            Ok(target)
        })
        .await??
    };

    debug!(client = %client, path = %target.relative, total_size, compressed, "Receiving upload");

    if let Some(parent) = target.absolute.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp = temp_sibling(&target.absolute);

    let body = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let reader = StreamReader::new(body);
    let source: Pin<Box<dyn AsyncRead + Send>> = if compressed {
        Box::pin(ZstdDecoder::new(BufReader::new(reader)))
    } else {
        Box::pin(reader)
    };

    let received = match receive(source, &temp, max).await {
        Ok(received) => received,
        Err(e) => {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
    };
    let (size, hash) = received;

    if size != total_size || hash != expected_hash {
        let _ = tokio::fs::remove_file(&temp).await;
        warn!(
            client = %client,
            path = %target.relative,
            expected_size = total_size,
            actual_size = size,
            expected_hash = %expected_hash,
            actual_hash = %hash,
            "Upload failed verification"
        );
        return Err(AgentError::Integrity(format!(
            "{}: expected {total_size} bytes with hash {expected_hash}, received {size} bytes with hash {hash}",
            target.relative
        )));
    }

    let relative = target.relative.clone();
    let backup_id = tokio::task::spawn_blocking(move || -> Result<Option<String>> {
        let backup_id = gateway.backup_before(std::slice::from_ref(&target.relative), "upload")?;
        std::fs::rename(&temp, &target.absolute).map_err(|e| {
            let _ = std::fs::remove_file(&temp);
            AgentError::from_io(e, &target.relative)
        })?;
        Ok(backup_id)
    })
    .await??;

    info!(client = %client, path = %relative, size, "Upload complete");
    let response = ApiResponse::ok(UploadResponse {
        path: relative,
        hash,
        size,
        backup_id,
    });
    Ok((StatusCode::OK, Json(response)).into_response())
}

/// Copy `source` into `temp`, hashing as it goes. Fails once `max` is exceeded.
async fn receive(
    mut source: Pin<Box<dyn AsyncRead + Send>>,
    temp: &Path,
    max: u64,
) -> Result<(u64, String)> {
    let mut file = tokio::fs::File::create(temp).await?;
    let mut hasher = StreamHasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| AgentError::BadRequest(format!("Upload stream error: {e}")))?;
        if n == 0 {
            break;
        }
        written += n as u64;
        if written > max {
            return Err(AgentError::PayloadTooLarge(format!(
                "upload exceeds {max} bytes"
            )));
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((written, hasher.finish()))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub path: String,
}

/// GET /api/download?path= - streamed file with hash and size headers
pub async fn download(
    State(gateway): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let (absolute, relative, size, hash) =
        tokio::task::spawn_blocking(move || -> Result<(PathBuf, String, u64, String)> {
            let target = gateway.guard().resolve_entry(&query.path)?;
            let meta = std::fs::metadata(&target.absolute)
                .map_err(|e| AgentError::from_io(e, &target.relative))?;
            if !meta.is_file() {
                return Err(AgentError::BadRequest(format!("{} is not a file", target.relative)));
            }
            let max = gateway.config().security.max_file_size;
            if meta.len() > max {
                return Err(AgentError::PayloadTooLarge(format!(
                    "{} is {} bytes (max {max})",
                    target.relative,
                    meta.len()
                )));
            }
            let hash = hash_file(&target.absolute)?;
            Ok((target.absolute, target.relative, meta.len(), hash))
        })
        .await??;

    let file = tokio::fs::File::open(&absolute).await?;
    debug!(client = %client, path = %relative, size, "Serving download");

    let body = Body::from_stream(ReaderStream::with_capacity(file, CHUNK_SIZE));
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (header::HeaderName::from_static(HEADER_CONTENT_HASH), hash),
            (header::HeaderName::from_static(HEADER_FILE_SIZE), size.to_string()),
        ],
        body,
    )
        .into_response())
}

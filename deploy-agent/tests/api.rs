//! In-process tests of the agent router.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use deploy_agent::{api, Config, Gateway};
use deploy_core::hash::hash_bytes;
use deploy_core::protocol::{
    HEADER_CLIENT_ID, HEADER_CONTENT_HASH, HEADER_FILE_SIZE, HEADER_RELATIVE_PATH,
    HEADER_TOTAL_SIZE,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "integration-token-123456";

fn app_with(configure: impl FnOnce(&mut Config)) -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::for_root(dir.path(), TOKEN);
    configure(&mut config);
    let gateway = Arc::new(Gateway::new(config).unwrap());
    (dir, api::create_router(gateway))
}

fn app() -> (TempDir, Router) {
    app_with(|_| {})
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, body.to_vec())
}

fn api_request(body: Value) -> Request<Body> {
    Request::post("/api")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(HEADER_CLIENT_ID, "tests")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn upload_request(path: &str, data: Vec<u8>, hash: &str, size: u64) -> Request<Body> {
    Request::post("/api/upload")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(HEADER_RELATIVE_PATH, path)
        .header(HEADER_CONTENT_HASH, hash)
        .header(HEADER_TOTAL_SIZE, size.to_string())
        .body(Body::from(data))
        .unwrap()
}

async fn call(app: &Router, body: Value) -> (StatusCode, Value) {
    let (status, _, bytes) = send(app, api_request(body)).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let (_dir, app) = app();
    let (status, _, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(status == StatusCode::OK || status == StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["status"].is_string());
    assert!(body["checks"]["root_readable"].as_bool().unwrap());
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let (_dir, app) = app();
    let request = Request::post("/api")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"action": "test"}).to_string()))
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    let body: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_test_action_and_malformed_body() {
    let (_dir, app) = app();
    let (status, body) = call(&app, json!({"action": "test"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["agent_id"].is_string());

    let (status, body) = call(&app, json!({"action": "teleport"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_upload_list_download_round_trip() {
    let (_dir, app) = app();
    let data = b"<?php echo 'deployed';".to_vec();
    let hash = hash_bytes(&data);

    let (status, _, body) = send(
        &app,
        upload_request("public/index.php", data.clone(), &hash, data.len() as u64),
    )
    .await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["hash"], hash);

    let (_, listed) = call(&app, json!({"action": "list"})).await;
    assert_eq!(listed["count"], 1);
    assert_eq!(listed["files"]["public/index.php"]["hash"], hash);

    let request = Request::get("/api/download?path=public/index.php")
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, headers, bytes) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, data);
    assert_eq!(headers[HEADER_CONTENT_HASH], hash.as_str());
    assert_eq!(headers[HEADER_FILE_SIZE], data.len().to_string().as_str());
}

#[tokio::test]
async fn test_upload_hash_mismatch_leaves_nothing_behind() {
    let (dir, app) = app();
    let data = b"payload".to_vec();
    let wrong = hash_bytes(b"something else");

    let (status, _, _) = send(&app, upload_request("a.txt", data, &wrong, 7)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != ".deploy")
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_zstd_upload_hashes_decompressed_bytes() {
    let (dir, app) = app();
    let data = b"body { color: red; }\n".repeat(50);
    let hash = hash_bytes(&data);
    let compressed = zstd::encode_all(&data[..], 3).unwrap();

    let mut request = upload_request("css/site.css", compressed, &hash, data.len() as u64);
    request
        .headers_mut()
        .insert(header::CONTENT_ENCODING, "zstd".parse().unwrap());
    let (status, _, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read(dir.path().join("css/site.css")).unwrap(), data);
}

#[tokio::test]
async fn test_upload_over_existing_creates_backup() {
    let (dir, app) = app();
    std::fs::write(dir.path().join("config.php"), b"old").unwrap();
    let data = b"new".to_vec();
    let hash = hash_bytes(&data);

    let (status, _, body) = send(&app, upload_request("config.php", data, &hash, 3)).await;
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body["backup_id"].is_string());

    let (_, backups) = call(&app, json!({"action": "backups"})).await;
    assert_eq!(backups["backups"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_traversal_and_oversize_rejected() {
    let (_dir, app) = app_with(|c| c.security.max_file_size = 8);
    let data = b"x".to_vec();
    let hash = hash_bytes(&data);

    let (status, _, _) = send(&app, upload_request("../escape.txt", data, &hash, 1)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let big = vec![b'a'; 16];
    let hash = hash_bytes(&big);
    let (status, _, _) = send(&app, upload_request("big.bin", big, &hash, 16)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, body) = call(&app, json!({"action": "read", "path": "a/../../etc/passwd"})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_rate_limit_returns_retry_after() {
    let (_dir, app) = app_with(|c| c.security.rate_limit_per_minute = 2);

    for _ in 0..2 {
        let (status, _) = call(&app, json!({"action": "test"})).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = send(&app, api_request(json!({"action": "test"}))).await;
    let body: Value = serde_json::from_slice(&body).unwrap();

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    assert_eq!(body["retry_after"], retry_after);
}

#[tokio::test]
async fn test_trash_restore_over_http() {
    let (dir, app) = app();
    std::fs::write(dir.path().join("old.html"), b"<p>old</p>").unwrap();

    let (status, deleted) = call(&app, json!({"action": "delete", "path": "old.html"})).await;
    assert_eq!(status, StatusCode::OK);
    let trash_id = deleted["trash_id"].as_str().unwrap().to_string();

    std::fs::write(dir.path().join("old.html"), b"<p>new</p>").unwrap();
    let (status, _) = call(&app, json!({"action": "restoreTrash", "id": trash_id})).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &app,
        json!({"action": "restoreTrash", "id": trash_id, "force": true}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(std::fs::read(dir.path().join("old.html")).unwrap(), b"<p>old</p>");
}

#[tokio::test]
async fn test_maintenance_mode_over_http() {
    let (_dir, app) = app();
    let (status, _) = call(&app, json!({"action": "lock", "message": "migrating"})).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, json!({"action": "mkdir", "path": "x"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("migrating"));

    let (status, body) = call(&app, json!({"action": "health"})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "maintenance");
}

//! Health check endpoints.

use super::AppState;
use crate::Result;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// GET /health - 200 when healthy, 503 with the same body when degraded
pub async fn health(State(gateway): State<AppState>) -> Result<Response> {
    let reply = tokio::task::spawn_blocking(move || gateway.health_reply()).await??;
    Ok((reply.status, Json(reply.body)).into_response())
}

/// GET /version - Version information endpoint
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "success": true,
        "version": env!("CARGO_PKG_VERSION"),
        "features": ["zstd", "tar", "tar.gz", "trash", "backup", "maintenance"],
    }))
}

//! HTTP API module for the deploy agent.

pub mod health;
pub mod transfer;

use crate::gateway::{ClientIdentity, Gateway};
use crate::{AgentError, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use deploy_core::protocol::{self, API_PATH, DOWNLOAD_PATH, HEALTH_PATH, UPLOAD_PATH, VERSION_PATH};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
pub type AppState = Arc<Gateway>;

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    // base64 inflates JSON `write` payloads by a third
    let max = state.config().security.max_file_size;
    let body_limit = usize::try_from(max.saturating_mul(4) / 3 + 1024 * 1024).unwrap_or(usize::MAX);

    let protected = Router::new()
        .route(API_PATH, post(dispatch))
        .route(UPLOAD_PATH, post(transfer::upload))
        .route(DOWNLOAD_PATH, get(transfer::download))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission));

    Router::new()
        .route(HEALTH_PATH, get(health::health))
        .route(VERSION_PATH, get(health::version))
        .merge(protected)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Token, allow-list and rate limit, in that order, before any handler runs.
async fn admission(State(gateway): State<AppState>, mut request: Request, next: Next) -> Result<Response> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = ClientIdentity::from_request(
        request.headers(),
        peer,
        gateway.config().security.trust_forwarded_for,
    );

    let headers = request.headers().clone();
    let who = client.clone();
    tokio::task::spawn_blocking(move || gateway.admit(&headers, &who)).await??;

    request.extensions_mut().insert(client);
    Ok(next.run(request).await)
}

/// POST /api - every JSON operation
async fn dispatch(
    State(gateway): State<AppState>,
    Extension(client): Extension<ClientIdentity>,
    payload: std::result::Result<Json<protocol::Request>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = payload.map_err(|rejection| {
        tracing::warn!(client = %client, "Malformed request: {}", rejection.body_text());
        AgentError::BadRequest(rejection.body_text())
    })?;

    let reply = tokio::task::spawn_blocking(move || gateway.dispatch(request, &client)).await??;
    Ok((reply.status, Json(reply.body)).into_response())
}

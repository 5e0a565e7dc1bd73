//! HTTP surface: the admin API and the dispatch (forward) handler.
//!
//! Dispatch order is strict: authenticate the API key, consult the
//! limiter, select an endpoint, forward. A failed step short-circuits
//! with a JSON error body.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::internal::endpoint::Endpoint;
use crate::internal::registry::{Client, StorageError};
use crate::internal::response::{ApiError, KeyResponse};
use crate::state::AppState;

pub const API_KEY_HEADER: &str = "X-API-Key";

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/client", post(add_client))
        .route("/client/:key", get(get_client).delete(delete_client))
        .route("/clients", get(list_clients))
        .fallback(forward)
        .with_state(state)
}

async fn add_client(
    State(state): State<AppState>,
    body: Result<Json<Client>, JsonRejection>,
) -> Result<Json<KeyResponse>, ApiError> {
    let Ok(Json(client)) = body else {
        return Err(ApiError::BadRequest("invalid JSON".to_string()));
    };

    client
        .validate()
        .map_err(|reason| ApiError::BadRequest(reason.to_string()))?;

    let key = state.registry.add(client.clone()).await.map_err(|err| {
        tracing::error!(error = %err, "add client");
        ApiError::Internal("failed to add a client".to_string())
    })?;

    tracing::info!(
        %key,
        name = %client.name,
        capacity = client.capacity,
        rate = client.rate,
        "add client"
    );

    Ok(Json(KeyResponse { key }))
}

async fn get_client(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Client>, ApiError> {
    if Uuid::parse_str(&key).is_err() {
        return Err(ApiError::BadRequest("invalid client key".to_string()));
    }

    match state.registry.get(&key).await {
        Ok(client) => {
            tracing::info!(%key, name = %client.name, "get client");
            Ok(Json(client))
        }
        Err(StorageError::NotFound) => Err(ApiError::NotFound("client is not found".to_string())),
        Err(err) => {
            tracing::error!(%key, error = %err, "get client");
            Err(ApiError::Internal("failed to get a client".to_string()))
        }
    }
}

async fn list_clients(State(state): State<AppState>) -> Result<Json<Vec<Client>>, ApiError> {
    let clients = state.registry.list().await.map_err(|err| {
        tracing::error!(error = %err, "get clients list");
        ApiError::Internal("failed to get clients".to_string())
    })?;

    tracing::info!(len = clients.len(), "get clients list");

    Ok(Json(clients))
}

async fn delete_client(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    if Uuid::parse_str(&key).is_err() {
        return Err(ApiError::BadRequest("invalid client key".to_string()));
    }

    match state.registry.delete(&key).await {
        Ok(()) => {
            tracing::info!(%key, "delete client");
            Ok(StatusCode::OK)
        }
        Err(StorageError::NotFound) => Err(ApiError::NotFound("client is not found".to_string())),
        Err(err) => {
            tracing::error!(%key, error = %err, "delete client");
            Err(ApiError::Internal("failed to delete a client".to_string()))
        }
    }
}

/// The dispatch pipeline behind every non-admin path.
async fn forward(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let key = match req.headers().get(API_KEY_HEADER) {
        Some(value) => value.to_str().unwrap_or("").to_string(),
        None => String::new(),
    };

    if key.is_empty() {
        tracing::error!(code = 401, "client key is not found");
        return ApiError::Unauthorized("client key is not found".to_string()).into_response();
    }

    if Uuid::parse_str(&key).is_err() {
        tracing::error!(code = 401, "invalid client key");
        return ApiError::Unauthorized("invalid client key".to_string()).into_response();
    }

    if !state.limiter.available(&key).await {
        tracing::error!(code = 429, client = %key, "too many requests");
        return ApiError::TooManyRequests("too many requests".to_string()).into_response();
    }

    let endpoint = state.strategy.lock().next();
    let Some(endpoint) = endpoint else {
        tracing::error!(code = 503, client = %key, "no available endpoint");
        return ApiError::ServiceUnavailable("no available endpoint".to_string()).into_response();
    };

    // Holds the connection count up for the whole upstream exchange.
    let _guard = state.track_connections.then(|| endpoint.new_connection());

    tracing::info!(client = %key, endpoint = %endpoint.id(), "forward request");

    proxy(&state, &endpoint, peer, req).await
}

/// Forwards the request to the endpoint, preserving method, path, query,
/// headers, and body. Transport errors answer 503.
async fn proxy(
    state: &AppState,
    endpoint: &Endpoint,
    peer: SocketAddr,
    req: Request,
) -> Response {
    let mut url = endpoint.url().clone();
    url.set_path(req.uri().path());
    url.set_query(req.uri().query());

    let method = req.method().clone();
    let headers = req.headers().clone();
    let body = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .unwrap_or_default();

    let mut builder = state.forward_client.request(method, url);
    for (name, value) in headers.iter() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, peer.ip()),
        None => peer.ip().to_string(),
    };
    builder = builder.header("x-forwarded-for", forwarded_for).body(body);

    match builder.send().await {
        Ok(upstream) => {
            let mut response = Response::builder().status(upstream.status());
            for (name, value) in upstream.headers().iter() {
                response = response.header(name, value);
            }

            let bytes = upstream.bytes().await.unwrap_or_default();
            response
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            tracing::error!(endpoint = %endpoint.id(), error = %err, "proxy error");
            ApiError::ServiceUnavailable("upstream is not reachable".to_string()).into_response()
        }
    }
}

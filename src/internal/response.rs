//! HTTP error and response bodies for the balancer surface.
//!
//! Every failed step answers with `{"code": <status>, "message": <text>}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

/// Body returned by `POST /client` with the assigned API key.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyResponse {
    pub key: String,
}

/// Balancer-level error mapped to an HTTP status code.
#[derive(Debug)]
pub enum ApiError {
    /// Missing or invalid API key (401).
    Unauthorized(String),
    /// Malformed input: bad JSON, bad UUID, invalid client fields (400).
    BadRequest(String),
    /// Unknown client key on the admin surface (404).
    NotFound(String),
    /// Client budget exhausted (429).
    TooManyRequests(String),
    /// No active endpoint, or the upstream is unreachable (503).
    ServiceUnavailable(String),
    /// Storage or other internal failure, details stay in the log (500).
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Unauthorized(m)
            | ApiError::BadRequest(m)
            | ApiError::NotFound(m)
            | ApiError::TooManyRequests(m)
            | ApiError::ServiceUnavailable(m)
            | ApiError::Internal(m) => m,
        };
        let body = Json(ErrorMessage {
            code: status.as_u16(),
            message,
        });
        (status, body).into_response()
    }
}

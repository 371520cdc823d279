//! HTTP API errors.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use meshbot_core::StoreError;

/// Failures surfaced to API callers as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server has no tokens, so every protected route is closed.
    #[error("No API tokens configured")]
    NoTokens,

    /// Missing or unknown token.
    #[error("Unauthorized")]
    Unauthorized,

    /// The token may read but not send.
    #[error("Token is not allowed to send")]
    Forbidden,

    /// Nothing matches the request.
    #[error("Not found")]
    NotFound,

    /// Malformed parameters or body.
    #[error("{0}")]
    BadRequest(String),

    /// The store failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn bad_request(reason: impl std::fmt::Display) -> Self {
        Self::BadRequest(reason.to_string())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoTokens | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Store(StoreError::Closed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

//! Error types for the cache service

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by cache service handlers
///
/// Every variant renders as `{ "error": string }` with a non-2xx status.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An entity with this id is already stored
    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            CacheError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            CacheError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            CacheError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            CacheError::Config(_) | CacheError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

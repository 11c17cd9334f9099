//! Crate-wide error type mapping onto the pipeline's failure policy:
//! upstream/RPC errors retry then surface, decode errors count-and-drop,
//! persistence errors roll back and retry, cancellation is success-with-
//! partial-results.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Transport/RPC failure after retry exhaustion.
    #[error("upstream RPC error: {0}")]
    Upstream(String),

    /// Malformed log payload. Counted and dropped, never fatal.
    #[error("log decode error: {0}")]
    Decode(String),

    /// Query miss; maps to HTTP 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// Subscriber queue overflow.
    #[error("subscriber capacity exceeded")]
    Capacity,

    /// Durable-store write failure; the local transaction was rolled back.
    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Cooperative cancellation; callers treat this as partial success.
    #[error("cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = match &self {
            AppError::NotFound(_) => "not_found",
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::Upstream(_) => "upstream",
            AppError::Cancelled => "cancelled",
            AppError::Capacity => "capacity",
            AppError::Persistence(_) => "persistence",
            _ => "internal",
        };
        let body = Json(serde_json::json!({
            "error": error,
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}

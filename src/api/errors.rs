//! API error types and HTTP status mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::ingest::IngestError;
use crate::scheduler::SchedulerError;
use crate::storage::StorageError;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// API error type that can be converted to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// No job owns the execution id.
    ExecutionNotFound(String),
    /// Resource not found.
    NotFound(String),
    /// The database cannot be reached.
    DatabaseUnavailable(String),
    /// Malformed request.
    InvalidRequest(String),
    /// The job is in a state that rejects the request.
    Conflict(String),
    /// Service unavailable (e.g., scheduler not running).
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

impl ApiError {
    /// Machine-readable code and HTTP status.
    pub fn code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::ExecutionNotFound(_) => (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::DatabaseUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "DATABASE_UNAVAILABLE")
            }
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.code();
        let message = match self {
            ApiError::ExecutionNotFound(msg)
            | ApiError::NotFound(msg)
            | ApiError::DatabaseUnavailable(msg)
            | ApiError::InvalidRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::ServiceUnavailable(msg)
            | ApiError::Internal(msg) => msg,
        };

        if status.is_server_error() {
            tracing::warn!(code, error = %message, "request failed");
        }

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        let message = err.to_string();
        match err {
            IngestError::ExecutionNotFound(_) => ApiError::ExecutionNotFound(message),
            IngestError::JobNotFound(_) => ApiError::NotFound(message),
            IngestError::Unavailable(_) => ApiError::DatabaseUnavailable(message),
            IngestError::Invalid(_) => ApiError::InvalidRequest(message),
            IngestError::Conflict(_) => ApiError::Conflict(message),
            IngestError::Internal(_) => ApiError::Internal(message),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Storage(e) => e.into(),
            SchedulerError::UnknownCycle(name) => {
                ApiError::InvalidRequest(format!("unknown cycle: {}", name))
            }
            SchedulerError::ChannelError(msg) => ApiError::ServiceUnavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => ApiError::NotFound(msg),
            StorageError::DuplicateKey(msg) => ApiError::Conflict(msg),
            StorageError::Unavailable(msg) => ApiError::DatabaseUnavailable(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

//! Server-specific error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::ingest::IngestError;
use crate::sync::{RelayError, SyncError};

/// Result type alias for route handlers
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Conflict { .. }
            | SyncError::InvalidTransition { .. }
            | SyncError::StaleSession { .. } => AppError::Conflict(err.to_string()),
            SyncError::NotFound(_) => AppError::NotFound(err.to_string()),
            SyncError::Validation(message) => AppError::Validation(message),
            SyncError::Relay(relay) => relay.into(),
            SyncError::Database(e) => AppError::Database(e),
            SyncError::Page(_)
            | SyncError::RetriesExhausted { .. }
            | SyncError::Corrupt(_)
            | SyncError::Serialization(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<RelayError> for AppError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NoConnection(_) | RelayError::ConnectionClosed(_) | RelayError::Timeout(_) => {
                AppError::Unavailable(err.to_string())
            },
            RelayError::Serialization(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidTransition { .. }
            | IngestError::AlreadyExists(_)
            | IngestError::StaleRecord { .. }
            | IngestError::Busy { .. }
            | IngestError::LocalFilesMissing(_) => AppError::Conflict(err.to_string()),
            IngestError::NotFound(_) => AppError::NotFound(err.to_string()),
            IngestError::FileNotValidated(_) | IngestError::IncompleteFiles(_) => {
                AppError::Conflict(err.to_string())
            },
            IngestError::Database(e) => AppError::Database(e),
            IngestError::Corrupt(_) | IngestError::Serialization(_) => {
                AppError::Internal(err.to_string())
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "A database error occurred".to_string())
            },
            AppError::NotFound(ref message) => (StatusCode::NOT_FOUND, message.clone()),
            AppError::Validation(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
            AppError::Conflict(ref message) => (StatusCode::CONFLICT, message.clone()),
            AppError::Unavailable(ref message) => (StatusCode::SERVICE_UNAVAILABLE, message.clone()),
            AppError::Internal(ref message) => {
                tracing::error!("Internal error: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, message.clone())
            },
            AppError::Unauthorized(ref message) => (StatusCode::UNAUTHORIZED, message.clone()),
            AppError::BadRequest(ref message) => (StatusCode::BAD_REQUEST, message.clone()),
        };

        let body = Json(json!({
            "error": {
                "message": error_message,
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

//! Live sync error types

use thiserror::Error;
use uuid::Uuid;

use super::models::{SyncSessionId, SyncStatus, SyncType};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("A {sync_type} sync is already active for this user (session {session_id})")]
    Conflict {
        sync_type: SyncType,
        session_id: SyncSessionId,
    },

    #[error("Invalid sync transition from {from} to {to}")]
    InvalidTransition { from: SyncStatus, to: SyncStatus },

    #[error("Sync session {0} not found")]
    NotFound(SyncSessionId),

    #[error("Sync session {session_id} is no longer {expected}")]
    StaleSession {
        session_id: SyncSessionId,
        expected: SyncStatus,
    },

    #[error("{0}")]
    Relay(#[from] RelayError),

    /// The API answered with something that is not a page
    #[error("Invalid page response: {0}")]
    Page(String),

    #[error("Page {page} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        page: u32,
        attempts: u32,
        last_error: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Corrupt sync row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of a relayed request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("No live connection for user {0}")]
    NoConnection(Uuid),

    #[error("Relayed request {0} timed out")]
    Timeout(Uuid),

    #[error("Connection closed before request {0} was answered")]
    ConnectionClosed(Uuid),

    #[error("Relay message could not be encoded: {0}")]
    Serialization(String),
}

impl RelayError {
    /// Worth another attempt once a connection is back
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::Timeout(_) | RelayError::ConnectionClosed(_))
    }
}

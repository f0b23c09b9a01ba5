//! Ingestion error types

use thiserror::Error;
use waxlog_common::{types::EntityType, types::MonthKey, CommonError};

use super::models::IngestionStatus;

/// State and persistence errors of the ingestion state machine
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid ingestion transition from {from} to {to}")]
    InvalidTransition {
        from: IngestionStatus,
        to: IngestionStatus,
    },

    #[error("Ingestion record for {0} already exists")]
    AlreadyExists(MonthKey),

    #[error("No ingestion record for {0}")]
    NotFound(MonthKey),

    #[error("Ingestion record for {month_key} is no longer {expected}; another worker moved it")]
    StaleRecord {
        month_key: MonthKey,
        expected: IngestionStatus,
    },

    #[error("{0} file has not been validated")]
    FileNotValidated(EntityType),

    #[error("Cannot complete {0}: validated files are still pending")]
    IncompleteFiles(MonthKey),

    #[error("Ingestion record for {month_key} is {status}; cannot {action}")]
    Busy {
        month_key: MonthKey,
        status: IngestionStatus,
        action: &'static str,
    },

    #[error("Downloaded files for {0} are no longer on disk; reset the month instead")]
    LocalFilesMissing(MonthKey),

    #[error("Corrupt ingestion row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while fetching a dump from the publisher
#[derive(Error, Debug)]
pub enum FetchError {
    /// The month's manifest is not published yet; not a failure
    #[error("Dump for {0} has not been published yet")]
    NotPublished(MonthKey),

    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch for {entity}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        entity: EntityType,
        expected: String,
        actual: String,
    },

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("{0}")]
    Common(#[from] CommonError),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// Worth another attempt within the same run
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => *status >= 500 || *status == 429,
            FetchError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

/// Errors raised while decoding a dump file
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed XML at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("Unexpected end of file inside <{0}>")]
    UnexpectedEof(String),
}

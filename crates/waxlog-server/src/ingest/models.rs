//! Ingestion record model
//!
//! One [`IngestionRecord`] exists per dump month. Its status walks
//!
//! ```text
//! NotStarted -> Downloading -> ReadyForProcessing -> Processing -> Completed
//!                    |                                   |
//!                    +------------> Failed <-------------+
//!                                     |
//!                                     +--> Downloading | Processing   (retry)
//! ```
//!
//! and every other edge is rejected. Recovery moves that sit outside the graph
//! (unpublished manifest, stuck reclaim, admin reset) are separate, named
//! methods so they never masquerade as ordinary transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;
use waxlog_common::types::{EntityType, MonthKey};

use super::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    NotStarted,
    Downloading,
    ReadyForProcessing,
    Processing,
    Completed,
    Failed,
}

impl IngestionStatus {
    pub const ALL: [IngestionStatus; 6] = [
        IngestionStatus::NotStarted,
        IngestionStatus::Downloading,
        IngestionStatus::ReadyForProcessing,
        IngestionStatus::Processing,
        IngestionStatus::Completed,
        IngestionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::NotStarted => "not_started",
            IngestionStatus::Downloading => "downloading",
            IngestionStatus::ReadyForProcessing => "ready_for_processing",
            IngestionStatus::Processing => "processing",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
        }
    }

    /// Owned by a job right now (or about to be)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            IngestionStatus::Downloading
                | IngestionStatus::ReadyForProcessing
                | IngestionStatus::Processing
        )
    }

    pub fn can_transition_to(&self, next: IngestionStatus) -> bool {
        use IngestionStatus::*;
        matches!(
            (self, next),
            (NotStarted, Downloading)
                | (Downloading, ReadyForProcessing)
                | (ReadyForProcessing, Processing)
                | (Processing, Completed)
                | (Downloading, Failed)
                | (Processing, Failed)
                | (Failed, Downloading)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestionStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IngestionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| IngestError::Corrupt(format!("unknown ingestion status '{}'", s)))
    }
}

/// Download/validation state of one entity file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Pending,
    Downloaded,
    Validated,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Per-file sub-status of a month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileState {
    pub downloaded: bool,
    pub validated: bool,
    pub status: FileStatus,
    pub processing_status: ProcessingStatus,
    #[serde(default)]
    pub records_processed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileState {
    pub fn mark_downloaded(&mut self) {
        self.downloaded = true;
        self.status = FileStatus::Downloaded;
        self.error = None;
    }

    pub fn mark_validated(&mut self) {
        self.downloaded = true;
        self.validated = true;
        self.status = FileStatus::Validated;
        self.error = None;
    }

    pub fn mark_invalid(&mut self, error: impl Into<String>) {
        self.validated = false;
        self.status = FileStatus::Failed;
        self.error = Some(error.into());
    }

    /// Validated and not yet fully upserted
    pub fn needs_processing(&self) -> bool {
        self.status == FileStatus::Validated && self.processing_status != ProcessingStatus::Completed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    pub id: Uuid,
    pub month_key: MonthKey,
    pub status: IngestionStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    /// Published SHA-256 per entity file
    pub checksums: BTreeMap<EntityType, String>,
    pub files: BTreeMap<EntityType, FileState>,
    pub started_at: Option<DateTime<Utc>>,
    pub download_completed_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionRecord {
    pub fn new(month_key: MonthKey) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            month_key,
            status: IngestionStatus::NotStarted,
            retry_count: 0,
            error_message: None,
            checksums: BTreeMap::new(),
            files: BTreeMap::new(),
            started_at: None,
            download_completed_at: None,
            processing_completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one edge of the transition graph, stamping timestamps and retry bookkeeping
    pub fn apply_transition(
        &mut self,
        next: IngestionStatus,
        now: DateTime<Utc>,
    ) -> Result<(), IngestError> {
        if !self.status.can_transition_to(next) {
            return Err(IngestError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        if next == IngestionStatus::Completed && self.files.values().any(FileState::needs_processing)
        {
            return Err(IngestError::IncompleteFiles(self.month_key));
        }

        if self.status == IngestionStatus::Failed {
            self.retry_count += 1;
            self.error_message = None;
        }

        match next {
            IngestionStatus::Downloading | IngestionStatus::Processing => {
                self.started_at = Some(now);
            },
            IngestionStatus::ReadyForProcessing => self.download_completed_at = Some(now),
            IngestionStatus::Completed => self.processing_completed_at = Some(now),
            IngestionStatus::NotStarted | IngestionStatus::Failed => {},
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn file_mut(&mut self, entity: EntityType) -> &mut FileState {
        self.files.entry(entity).or_default()
    }

    /// Entity files still owed a processing pass
    pub fn pending_files(&self) -> Vec<EntityType> {
        self.files
            .iter()
            .filter(|(_, state)| state.needs_processing())
            .map(|(entity, _)| *entity)
            .collect()
    }

    /// Mark a file fully upserted; only validated files may complete
    pub fn complete_file(&mut self, entity: EntityType) -> Result<(), IngestError> {
        let state = self.file_mut(entity);
        if state.status != FileStatus::Validated {
            return Err(IngestError::FileNotValidated(entity));
        }
        state.processing_status = ProcessingStatus::Completed;
        state.error = None;
        Ok(())
    }

    pub fn fail_file(&mut self, entity: EntityType, error: impl Into<String>) {
        let state = self.file_mut(entity);
        state.processing_status = ProcessingStatus::Failed;
        state.error = Some(error.into());
    }

    /// Retry budget used up; only an admin reset brings it back
    pub fn retries_exhausted(&self, max_retries: i32) -> bool {
        self.status == IngestionStatus::Failed && self.retry_count >= max_retries
    }

    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return false;
        };
        self.status == IngestionStatus::Processing
            && self.started_at.map_or(true, |started| now - started > threshold)
    }
}

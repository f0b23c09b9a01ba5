//! Ingestion state machine
//!
//! Every status change is persisted immediately with a compare-and-swap on
//! the previous status. If the swap loses, the in-memory record is rolled
//! back and [`IngestError::StaleRecord`] tells the caller to let go.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use waxlog_common::types::MonthKey;

use super::error::IngestError;
use super::models::{IngestionRecord, IngestionStatus, ProcessingStatus};
use super::repository::IngestionRepository;

#[derive(Clone)]
pub struct IngestionStateMachine {
    repo: Arc<dyn IngestionRepository>,
}

impl IngestionStateMachine {
    pub fn new(repo: Arc<dyn IngestionRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn IngestionRepository> {
        &self.repo
    }

    pub async fn create(&self, month_key: MonthKey) -> Result<IngestionRecord, IngestError> {
        let record = IngestionRecord::new(month_key);
        self.repo.insert(&record).await?;
        info!(month_key = %month_key, "Created ingestion record");
        Ok(record)
    }

    /// Load the month, creating it on first sight
    pub async fn get_or_create(&self, month_key: MonthKey) -> Result<IngestionRecord, IngestError> {
        if let Some(record) = self.repo.find_by_month(month_key).await? {
            return Ok(record);
        }
        match self.create(month_key).await {
            Ok(record) => Ok(record),
            // Lost the insert race; the winner's row is authoritative
            Err(IngestError::AlreadyExists(_)) => self
                .repo
                .find_by_month(month_key)
                .await?
                .ok_or(IngestError::NotFound(month_key)),
            Err(e) => Err(e),
        }
    }

    pub async fn transition(
        &self,
        record: &mut IngestionRecord,
        next: IngestionStatus,
    ) -> Result<(), IngestError> {
        let from = record.status;
        self.apply(record, |r| r.apply_transition(next, Utc::now()))
            .await?;
        info!(
            month_key = %record.month_key,
            from = %from,
            to = %next,
            retry_count = record.retry_count,
            "Ingestion status changed"
        );
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        record: &mut IngestionRecord,
        error: impl std::fmt::Display,
    ) -> Result<(), IngestError> {
        let message = error.to_string();
        self.apply(record, |r| {
            r.apply_transition(IngestionStatus::Failed, Utc::now())?;
            r.error_message = Some(message.clone());
            Ok(())
        })
        .await?;
        warn!(
            month_key = %record.month_key,
            retry_count = record.retry_count,
            error = %message,
            "Ingestion failed"
        );
        Ok(())
    }

    /// Persist per-file progress without changing status
    pub async fn save_progress(&self, record: &mut IngestionRecord) -> Result<(), IngestError> {
        self.apply(record, |r| {
            r.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    /// Downloading -> NotStarted when the manifest is not out yet
    pub async fn reset_unpublished(&self, record: &mut IngestionRecord) -> Result<(), IngestError> {
        self.expect_status(record, IngestionStatus::Downloading, "reset an unpublished dump")?;
        self.apply(record, |r| {
            r.status = IngestionStatus::NotStarted;
            r.started_at = None;
            r.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        info!(month_key = %record.month_key, "Dump not published yet, will retry next run");
        Ok(())
    }

    /// Processing -> ReadyForProcessing for a record whose worker vanished.
    /// Completed files keep their status; interrupted ones go back to Pending.
    pub async fn reclaim_stuck(&self, record: &mut IngestionRecord) -> Result<(), IngestError> {
        self.expect_status(record, IngestionStatus::Processing, "reclaim")?;
        let started_at = record.started_at;
        self.apply(record, |r| {
            r.status = IngestionStatus::ReadyForProcessing;
            for state in r.files.values_mut() {
                if state.processing_status == ProcessingStatus::Processing {
                    state.processing_status = ProcessingStatus::Pending;
                }
            }
            r.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        warn!(
            month_key = %record.month_key,
            started_at = ?started_at,
            "Reclaimed stuck ingestion record"
        );
        Ok(())
    }

    /// Admin reset: back to NotStarted with a fresh retry budget.
    /// A failed month keeps its upserted files so they are not fetched again;
    /// a completed month drops every file state and is ingested from scratch.
    pub async fn reset_for_retry(&self, month_key: MonthKey) -> Result<IngestionRecord, IngestError> {
        let mut record = self.load(month_key).await?;
        if record.status.is_active() {
            return Err(IngestError::Busy {
                month_key,
                status: record.status,
                action: "reset",
            });
        }
        let full_reingest = record.status == IngestionStatus::Completed;
        self.apply(&mut record, |r| {
            r.status = IngestionStatus::NotStarted;
            r.retry_count = 0;
            r.error_message = None;
            r.started_at = None;
            r.download_completed_at = None;
            r.processing_completed_at = None;
            if full_reingest {
                r.files.clear();
                r.checksums.clear();
            } else {
                r.files.retain(|_, state| state.processing_status == ProcessingStatus::Completed);
            }
            r.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        info!(month_key = %month_key, full_reingest, "Ingestion record reset by admin");
        Ok(record)
    }

    /// Admin reprocess: queue every validated file for another upsert pass
    pub async fn requeue_processing(
        &self,
        month_key: MonthKey,
    ) -> Result<IngestionRecord, IngestError> {
        let mut record = self.load(month_key).await?;
        let reprocessable = matches!(
            record.status,
            IngestionStatus::Completed | IngestionStatus::Failed | IngestionStatus::ReadyForProcessing
        ) && record.download_completed_at.is_some();

        if !reprocessable {
            return Err(IngestError::Busy {
                month_key,
                status: record.status,
                action: "reprocess",
            });
        }

        self.apply(&mut record, |r| {
            r.status = IngestionStatus::ReadyForProcessing;
            r.error_message = None;
            r.processing_completed_at = None;
            for state in r.files.values_mut() {
                state.processing_status = ProcessingStatus::Pending;
                state.records_processed = 0;
                state.error = None;
            }
            r.updated_at = Utc::now();
            Ok(())
        })
        .await?;
        info!(month_key = %month_key, "Ingestion record queued for reprocessing");
        Ok(record)
    }

    async fn load(&self, month_key: MonthKey) -> Result<IngestionRecord, IngestError> {
        self.repo
            .find_by_month(month_key)
            .await?
            .ok_or(IngestError::NotFound(month_key))
    }

    fn expect_status(
        &self,
        record: &IngestionRecord,
        expected: IngestionStatus,
        action: &'static str,
    ) -> Result<(), IngestError> {
        if record.status == expected {
            Ok(())
        } else {
            Err(IngestError::Busy {
                month_key: record.month_key,
                status: record.status,
                action,
            })
        }
    }

    /// Mutate, then swap against the pre-mutation status; roll back on any failure
    async fn apply<F>(&self, record: &mut IngestionRecord, mutate: F) -> Result<(), IngestError>
    where
        F: FnOnce(&mut IngestionRecord) -> Result<(), IngestError>,
    {
        let snapshot = record.clone();
        let expected = snapshot.status;

        if let Err(e) = mutate(record) {
            *record = snapshot;
            return Err(e);
        }

        match self.repo.compare_and_swap(record, expected).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                *record = snapshot;
                Err(IngestError::StaleRecord {
                    month_key: record.month_key,
                    expected,
                })
            },
            Err(e) => {
                *record = snapshot;
                Err(e)
            },
        }
    }
}

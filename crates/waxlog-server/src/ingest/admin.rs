//! Operator controls for the dump pipeline

use std::sync::Arc;
use tracing::info;
use waxlog_common::types::MonthKey;

use super::download_job::{DownloadJob, DOWNLOAD_JOB_NAME};
use super::error::IngestError;
use super::models::IngestionRecord;
use super::processing_job::PROCESSING_JOB_NAME;
use super::scheduler::SchedulerHandle;
use super::state::IngestionStateMachine;

/// Months listed by [`DownloadAdmin::status`]
pub const STATUS_LIMIT: i64 = 24;

#[derive(Clone)]
pub struct DownloadAdmin {
    machine: IngestionStateMachine,
    download: Arc<DownloadJob>,
    scheduler: SchedulerHandle,
}

impl DownloadAdmin {
    pub fn new(
        machine: IngestionStateMachine,
        download: Arc<DownloadJob>,
        scheduler: SchedulerHandle,
    ) -> Self {
        Self {
            machine,
            download,
            scheduler,
        }
    }

    /// Most recent months, newest first
    pub async fn status(&self) -> Result<Vec<IngestionRecord>, IngestError> {
        self.machine.repository().list_recent(STATUS_LIMIT).await
    }

    /// Run the download check for `month` (default: current month) right away
    pub async fn trigger(&self, month: Option<MonthKey>) -> MonthKey {
        let month = month.unwrap_or_else(MonthKey::current);
        self.download.request(month).await;
        self.scheduler.trigger(DOWNLOAD_JOB_NAME);
        self.scheduler.trigger(PROCESSING_JOB_NAME);
        info!(month_key = %month, "Download triggered by admin");
        month
    }

    /// Upsert every file of an already downloaded month again
    pub async fn reprocess(&self, month: Option<MonthKey>) -> Result<IngestionRecord, IngestError> {
        let month = month.unwrap_or_else(MonthKey::current);
        let record = self
            .machine
            .repository()
            .find_by_month(month)
            .await?
            .ok_or(IngestError::NotFound(month))?;

        for entity in record.files.keys() {
            let path = self.download.layout().local_path(month, *entity);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Err(IngestError::LocalFilesMissing(month));
            }
        }

        let record = self.machine.requeue_processing(month).await?;
        self.scheduler.trigger(PROCESSING_JOB_NAME);
        Ok(record)
    }

    /// Clear a failed or exhausted month and download it again
    pub async fn reset(&self, month: Option<MonthKey>) -> Result<IngestionRecord, IngestError> {
        let month = month.unwrap_or_else(MonthKey::current);
        let record = self.machine.reset_for_retry(month).await?;
        self.download.request(month).await;
        self.scheduler.trigger(DOWNLOAD_JOB_NAME);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::IngestConfig;
    use crate::ingest::models::{IngestionStatus, ProcessingStatus};
    use crate::ingest::repository::MemoryIngestionRepository;
    use waxlog_common::types::EntityType;

    fn month() -> MonthKey {
        "2025-02".parse().unwrap()
    }

    fn admin(data_dir: &std::path::Path) -> DownloadAdmin {
        let config = IngestConfig {
            data_dir: data_dir.to_path_buf(),
            ..IngestConfig::default()
        };
        let machine = IngestionStateMachine::new(Arc::new(MemoryIngestionRepository::new()));
        let download = Arc::new(DownloadJob::new(machine.clone(), &config).unwrap());
        DownloadAdmin::new(machine, download, SchedulerHandle::default())
    }

    async fn failed_download(admin: &DownloadAdmin) {
        let mut record = admin.machine.create(month()).await.unwrap();
        admin
            .machine
            .transition(&mut record, IngestionStatus::Downloading)
            .await
            .unwrap();
        record.file_mut(EntityType::Artists).mark_validated();
        record.file_mut(EntityType::Artists).processing_status = ProcessingStatus::Completed;
        record.file_mut(EntityType::Labels).mark_invalid("checksum");
        admin.machine.mark_failed(&mut record, "checksum").await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_keeps_completed_files_and_clears_retries() {
        let dir = tempfile::tempdir().unwrap();
        let admin = admin(dir.path());
        failed_download(&admin).await;

        let record = admin.reset(Some(month())).await.unwrap();
        assert_eq!(record.status, IngestionStatus::NotStarted);
        assert_eq!(record.retry_count, 0);
        assert!(record.error_message.is_none());
        assert!(record.files.contains_key(&EntityType::Artists));
        assert!(!record.files.contains_key(&EntityType::Labels));
    }

    #[tokio::test]
    async fn test_reset_rejects_active_month() {
        let dir = tempfile::tempdir().unwrap();
        let admin = admin(dir.path());
        let mut record = admin.machine.create(month()).await.unwrap();
        admin
            .machine
            .transition(&mut record, IngestionStatus::Downloading)
            .await
            .unwrap();

        let err = admin.reset(Some(month())).await.unwrap_err();
        assert!(matches!(err, IngestError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_reprocess_needs_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let admin = admin(dir.path());
        let mut record = admin.machine.create(month()).await.unwrap();
        admin
            .machine
            .transition(&mut record, IngestionStatus::Downloading)
            .await
            .unwrap();
        record.file_mut(EntityType::Masters).mark_validated();
        admin
            .machine
            .transition(&mut record, IngestionStatus::ReadyForProcessing)
            .await
            .unwrap();

        let err = admin.reprocess(Some(month())).await.unwrap_err();
        assert!(matches!(err, IngestError::LocalFilesMissing(_)));

        let path = admin.download.layout().local_path(month(), EntityType::Masters);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"").unwrap();

        let record = admin.reprocess(Some(month())).await.unwrap();
        assert_eq!(record.status, IngestionStatus::ReadyForProcessing);
    }

    #[tokio::test]
    async fn test_trigger_defaults_to_current_month() {
        let dir = tempfile::tempdir().unwrap();
        let admin = admin(dir.path());
        assert_eq!(admin.trigger(None).await, MonthKey::current());
    }
}

//! Scheduled dump download
//!
//! Each run looks at one month (the current one, or whatever an admin queued),
//! fetches the manifest and every entity file, and leaves the record in
//! ReadyForProcessing for [`ProcessingJob`](super::processing_job::ProcessingJob).

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use waxlog_common::types::MonthKey;

use super::config::IngestConfig;
use super::error::{FetchError, IngestError};
use super::fetcher::{DumpFetcher, DumpLayout};
use super::models::{IngestionRecord, IngestionStatus, ProcessingStatus};
use super::scheduler::Job;
use super::state::IngestionStateMachine;

pub const DOWNLOAD_JOB_NAME: &str = "dump-download";

/// What one run did with a month
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// All files fetched and verified
    Downloaded,
    /// No manifest yet; the record is back at NotStarted
    NotPublished,
    /// Left alone because of its status
    Skipped(IngestionStatus),
    /// Failed too often; waits for an admin reset
    RetriesExhausted,
    /// Another worker claimed the record first
    Claimed,
    Failed(String),
}

pub struct DownloadJob {
    machine: IngestionStateMachine,
    fetcher: DumpFetcher,
    max_retries: i32,
    requested: Mutex<Vec<MonthKey>>,
}

impl DownloadJob {
    pub fn new(machine: IngestionStateMachine, config: &IngestConfig) -> Result<Self, FetchError> {
        Ok(Self {
            machine,
            fetcher: DumpFetcher::new(config)?,
            max_retries: config.max_retries,
            requested: Mutex::new(Vec::new()),
        })
    }

    pub fn layout(&self) -> &DumpLayout {
        self.fetcher.layout()
    }

    /// Queue a month for the next run instead of the current month
    pub async fn request(&self, month: MonthKey) {
        let mut requested = self.requested.lock().await;
        if !requested.contains(&month) {
            requested.push(month);
        }
    }

    pub async fn run_for(&self, month: MonthKey) -> anyhow::Result<DownloadOutcome> {
        let mut record = self.machine.get_or_create(month).await?;

        match record.status {
            IngestionStatus::NotStarted => {},
            // Download finished before the failure; processing owns the retry
            IngestionStatus::Failed if record.download_completed_at.is_some() => {
                return Ok(DownloadOutcome::Skipped(record.status));
            },
            IngestionStatus::Failed if record.retries_exhausted(self.max_retries) => {
                warn!(
                    month_key = %month,
                    retry_count = record.retry_count,
                    "Download retries exhausted, waiting for admin reset"
                );
                return Ok(DownloadOutcome::RetriesExhausted);
            },
            IngestionStatus::Failed => {},
            status => {
                debug!(month_key = %month, status = %status, "Nothing to download");
                return Ok(DownloadOutcome::Skipped(status));
            },
        }

        match self
            .machine
            .transition(&mut record, IngestionStatus::Downloading)
            .await
        {
            Ok(()) => {},
            Err(IngestError::StaleRecord { .. }) => return Ok(DownloadOutcome::Claimed),
            Err(e) => return Err(e.into()),
        }

        match self.download(&mut record).await {
            Ok(()) => {
                self.machine
                    .transition(&mut record, IngestionStatus::ReadyForProcessing)
                    .await?;
                info!(month_key = %month, files = record.files.len(), "Dump downloaded");
                Ok(DownloadOutcome::Downloaded)
            },
            Err(e) if matches!(e.downcast_ref::<FetchError>(), Some(FetchError::NotPublished(_))) => {
                self.machine.reset_unpublished(&mut record).await?;
                Ok(DownloadOutcome::NotPublished)
            },
            Err(e) => {
                let message = format!("{e:#}");
                self.machine.mark_failed(&mut record, &message).await?;
                Ok(DownloadOutcome::Failed(message))
            },
        }
    }

    async fn download(&self, record: &mut IngestionRecord) -> anyhow::Result<()> {
        let month = record.month_key;
        let manifest = self.fetcher.fetch_manifest(month).await?;

        record.checksums = manifest.checksums.clone();
        self.machine.save_progress(record).await?;

        for (entity, expected) in &manifest.checksums {
            let entity = *entity;
            let done = record
                .files
                .get(&entity)
                .is_some_and(|f| f.processing_status == ProcessingStatus::Completed);
            if done {
                debug!(month_key = %month, entity = %entity, "Already upserted, not fetching again");
                continue;
            }

            match self.fetcher.fetch_file(month, entity, expected).await {
                Ok(_) => record.file_mut(entity).mark_validated(),
                Err(e @ FetchError::ChecksumMismatch { .. }) => {
                    let state = record.file_mut(entity);
                    state.mark_downloaded();
                    state.mark_invalid(e.to_string());
                    self.machine.save_progress(record).await?;
                    return Err(e.into());
                },
                Err(e) => {
                    return Err(e).with_context(|| format!("fetching {entity} for {month}"));
                },
            }
            self.machine.save_progress(record).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Job for DownloadJob {
    fn name(&self) -> &'static str {
        DOWNLOAD_JOB_NAME
    }

    async fn run(&self) -> anyhow::Result<()> {
        let queued: Vec<MonthKey> = std::mem::take(&mut *self.requested.lock().await);
        let months = if queued.is_empty() {
            vec![MonthKey::current()]
        } else {
            queued
        };

        for month in months {
            let outcome = self
                .run_for(month)
                .await
                .with_context(|| format!("download run for {month}"))?;
            debug!(month_key = %month, outcome = ?outcome, "Download check finished");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::models::FileStatus;
    use crate::ingest::repository::MemoryIngestionRepository;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use waxlog_common::types::EntityType;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn month() -> MonthKey {
        "2025-02".parse().unwrap()
    }

    fn job(server: &MockServer, data_dir: &std::path::Path) -> DownloadJob {
        let config = IngestConfig {
            dump_base_url: server.uri(),
            data_dir: data_dir.to_path_buf(),
            retry_backoff_ms: 1,
            download_attempts: 1,
            ..IngestConfig::default()
        };
        let machine = IngestionStateMachine::new(Arc::new(MemoryIngestionRepository::new()));
        DownloadJob::new(machine, &config).unwrap()
    }

    #[tokio::test]
    async fn test_unpublished_month_resets_to_not_started() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let job = job(&server, dir.path());

        let outcome = job.run_for(month()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::NotPublished);

        let record = job.machine.repository().find_by_month(month()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::NotStarted);
        assert_eq!(record.retry_count, 0);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_fails_record_and_file() {
        let server = MockServer::start().await;
        let body = b"not the published bytes".to_vec();
        let wrong = hex::encode(Sha256::digest(b"something else"));
        Mock::given(method("GET"))
            .and(path("/data/2025/discogs_20250201_CHECKSUM.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{wrong} discogs_20250201_labels.xml.gz\n"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2025/discogs_20250201_labels.xml.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let job = job(&server, dir.path());

        let outcome = job.run_for(month()).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Failed(_)));

        let record = job.machine.repository().find_by_month(month()).await.unwrap().unwrap();
        assert_eq!(record.status, IngestionStatus::Failed);
        assert!(record.error_message.unwrap().contains("Checksum mismatch"));
        let file = &record.files[&EntityType::Labels];
        assert_eq!(file.status, FileStatus::Failed);
        assert!(file.downloaded);
        assert!(!file.validated);
    }

    #[tokio::test]
    async fn test_exhausted_record_is_left_alone() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let job = job(&server, dir.path());

        let mut record = job.machine.create(month()).await.unwrap();
        record.status = IngestionStatus::Failed;
        record.retry_count = job.max_retries;
        job.machine
            .repository()
            .compare_and_swap(&record, IngestionStatus::NotStarted)
            .await
            .unwrap();

        let outcome = job.run_for(month()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::RetriesExhausted);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_record_is_skipped() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let job = job(&server, dir.path());

        let mut record = job.machine.create(month()).await.unwrap();
        job.machine
            .transition(&mut record, IngestionStatus::Downloading)
            .await
            .unwrap();

        let outcome = job.run_for(month()).await.unwrap();
        assert_eq!(outcome, DownloadOutcome::Skipped(IngestionStatus::Downloading));
    }
}

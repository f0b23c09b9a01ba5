//! Scheduled dump processing
//!
//! Picks up every month that is ready (or stuck, or failed after a complete
//! download), and streams each outstanding entity file into the catalog.
//! Files of one month run in parallel, bounded by a semaphore; their shared
//! per-file status lives behind a mutex and is persisted after every batch.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use waxlog_common::types::{EntityType, MonthKey};

use super::config::IngestConfig;
use super::error::IngestError;
use super::fetcher::DumpLayout;
use super::models::{IngestionRecord, IngestionStatus, ProcessingStatus};
use super::parser::{parse_file, ParseSummary};
use super::records::spec_for;
use super::scheduler::Job;
use super::state::IngestionStateMachine;
use super::writer::CatalogWriter;

pub const PROCESSING_JOB_NAME: &str = "dump-processing";

/// Parsed batches buffered between the parser thread and the writer
const BATCH_CHANNEL_CAPACITY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed,
    Failed(String),
    /// Another worker claimed the record first
    Claimed,
}

pub struct ProcessingJob {
    machine: IngestionStateMachine,
    writer: Arc<dyn CatalogWriter>,
    layout: DumpLayout,
    config: IngestConfig,
}

/// Everything one file worker needs, cloned into its task
#[derive(Clone)]
struct FileContext {
    machine: IngestionStateMachine,
    writer: Arc<dyn CatalogWriter>,
    record: Arc<Mutex<IngestionRecord>>,
    month: MonthKey,
    batch_size: usize,
}

impl ProcessingJob {
    pub fn new(
        machine: IngestionStateMachine,
        writer: Arc<dyn CatalogWriter>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            machine,
            writer,
            layout: DumpLayout::new(&config.dump_base_url, &config.data_dir),
            config: config.clone(),
        }
    }

    /// Records this run should process, oldest month first.
    /// Stuck records are reclaimed to ReadyForProcessing on the way.
    pub async fn candidates(&self) -> Result<Vec<IngestionRecord>, IngestError> {
        let repo = self.machine.repository();
        let mut ready = repo.find_by_status(IngestionStatus::ReadyForProcessing).await?;

        let now = Utc::now();
        for mut record in repo.find_by_status(IngestionStatus::Processing).await? {
            if !record.is_stuck(now, self.config.stuck_threshold()) {
                continue;
            }
            match self.machine.reclaim_stuck(&mut record).await {
                Ok(()) => ready.push(record),
                Err(IngestError::StaleRecord { .. }) => {
                    debug!(month_key = %record.month_key, "Stuck record moved by another worker");
                },
                Err(e) => return Err(e),
            }
        }

        for record in repo.find_by_status(IngestionStatus::Failed).await? {
            if record.download_completed_at.is_some()
                && !record.retries_exhausted(self.config.max_retries)
            {
                ready.push(record);
            }
        }

        ready.sort_by_key(|r| r.month_key);
        Ok(ready)
    }

    pub async fn process(&self, mut record: IngestionRecord) -> anyhow::Result<ProcessOutcome> {
        let month = record.month_key;
        match self
            .machine
            .transition(&mut record, IngestionStatus::Processing)
            .await
        {
            Ok(()) => {},
            Err(IngestError::StaleRecord { .. }) => return Ok(ProcessOutcome::Claimed),
            Err(e) => return Err(e.into()),
        }

        let pending = record.pending_files();
        for entity in &pending {
            record.file_mut(*entity).processing_status = ProcessingStatus::Processing;
        }
        self.machine.save_progress(&mut record).await?;
        info!(month_key = %month, files = pending.len(), "Processing dump");

        let context = FileContext {
            machine: self.machine.clone(),
            writer: self.writer.clone(),
            record: Arc::new(Mutex::new(record)),
            month,
            batch_size: self.config.batch_size.max(1),
        };
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_files.max(1)));
        let mut tasks = JoinSet::new();

        for entity in pending {
            let context = context.clone();
            let semaphore = semaphore.clone();
            let path = self.layout.local_path(month, entity);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => process_file(&context, entity, path.clone()).await,
                    Err(e) => Err(e.into()),
                };
                (entity, path, result)
            });
        }

        let mut first_error: Option<String> = None;
        while let Some(joined) = tasks.join_next().await {
            let (entity, path, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(month_key = %month, error = %e, "File worker panicked");
                    first_error.get_or_insert_with(|| format!("file worker panicked: {e}"));
                    continue;
                },
            };

            let mut record = context.record.lock().await;
            let result = result.and_then(|summary| {
                record.complete_file(entity)?;
                Ok(summary)
            });
            match result {
                Ok(summary) => {
                    info!(
                        month_key = %month,
                        entity = %entity,
                        records = summary.records,
                        skipped = summary.skipped,
                        "Dump file processed"
                    );
                    remove_processed(&path).await;
                },
                Err(e) => {
                    let message = format!("{entity}: {e:#}");
                    warn!(month_key = %month, error = %message, "Dump file failed");
                    record.fail_file(entity, format!("{e:#}"));
                    first_error.get_or_insert(message);
                },
            }
            if let Err(e) = self.machine.save_progress(&mut record).await {
                error!(month_key = %month, entity = %entity, error = %e, "Failed to save file progress");
                first_error.get_or_insert_with(|| format!("saving {entity} progress: {e}"));
            }
        }

        let mut record = context.record.lock().await.clone();
        if let Some(message) = first_error {
            self.machine.mark_failed(&mut record, &message).await?;
            return Ok(ProcessOutcome::Failed(message));
        }

        self.machine
            .transition(&mut record, IngestionStatus::Completed)
            .await?;
        info!(month_key = %month, "Dump ingestion completed");

        let dir = self.layout.month_dir(month);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %e, "Failed to remove month directory");
            }
        }
        Ok(ProcessOutcome::Completed)
    }
}

/// Parse on a blocking thread and upsert batches as they arrive
async fn process_file(
    context: &FileContext,
    entity: EntityType,
    path: PathBuf,
) -> anyhow::Result<ParseSummary> {
    let spec = spec_for(entity);
    let batch_size = context.batch_size;
    let (tx, mut rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
    let parser = tokio::task::spawn_blocking(move || parse_file(&path, spec, batch_size, tx));

    let mut written = 0u64;
    let mut write_error = None;
    while let Some(batch) = rx.recv().await {
        let size = batch.len() as u64;
        if let Err(e) = context.writer.upsert_batch(context.month, batch).await {
            write_error = Some(e);
            break;
        }
        written += size;

        let mut record = context.record.lock().await;
        record.file_mut(entity).records_processed = written;
        if let Err(e) = context.machine.save_progress(&mut record).await {
            write_error = Some(e.into());
            break;
        }
    }
    // Closing the receiver stops the parser at its next send
    drop(rx);

    let parsed = parser.await;
    if let Some(e) = write_error {
        return Err(e.context(format!("writing {entity} batch")));
    }
    let summary = parsed
        .context("parser task panicked")?
        .with_context(|| format!("parsing {entity}"))?;
    Ok(summary)
}

async fn remove_processed(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to delete processed file");
        }
    }
}

#[async_trait]
impl Job for ProcessingJob {
    fn name(&self) -> &'static str {
        PROCESSING_JOB_NAME
    }

    async fn run(&self) -> anyhow::Result<()> {
        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            debug!("No dumps ready for processing");
            return Ok(());
        }

        let total = candidates.len();
        let mut errored = 0;
        for record in candidates {
            let month = record.month_key;
            match self.process(record).await {
                Ok(outcome) => {
                    debug!(month_key = %month, outcome = ?outcome, "Processing run finished");
                },
                Err(e) => {
                    error!(month_key = %month, error = %format!("{e:#}"), "Processing run errored");
                    errored += 1;
                },
            }
        }

        if errored > 0 {
            anyhow::bail!("{errored} of {total} months could not be processed");
        }
        Ok(())
    }
}

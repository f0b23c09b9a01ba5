//! Monthly dump ingestion
//!
//! # Architecture
//!
//! - **config**: `INGEST_*` settings
//! - **models** / **state** / **repository**: the per-month `IngestionRecord`,
//!   its transition graph and compare-and-swap persistence
//! - **fetcher**: manifest and file download with checksum verification
//! - **records** / **parser**: typed catalog records and the streaming XML parser
//! - **writer**: batched `INSERT ... ON CONFLICT` upserts
//! - **download_job** / **processing_job**: the two scheduled jobs
//! - **scheduler**: fixed-interval job loops with manual triggers
//! - **admin**: status, trigger, reprocess and reset for operators
//!
//! # Public API
//!
//! Admin endpoints live in `features::downloads`:
//! - `GET /api/v1/admin/downloads/status`
//! - `POST /api/v1/admin/downloads/trigger`
//! - `POST /api/v1/admin/downloads/reprocess`
//! - `POST /api/v1/admin/downloads/reset`

pub mod admin;
pub mod config;
pub mod download_job;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod processing_job;
pub mod records;
pub mod repository;
pub mod scheduler;
pub mod state;
pub mod writer;

pub use admin::DownloadAdmin;
pub use config::IngestConfig;
pub use download_job::{DownloadJob, DownloadOutcome};
pub use error::{FetchError, IngestError, ParseError};
pub use models::{IngestionRecord, IngestionStatus};
pub use processing_job::{ProcessOutcome, ProcessingJob};
pub use repository::{IngestionRepository, MemoryIngestionRepository, PgIngestionRepository};
pub use scheduler::{Job, Scheduler, SchedulerHandle};
pub use state::IngestionStateMachine;
pub use writer::{CatalogWriter, MemoryCatalogWriter, PgCatalogWriter};

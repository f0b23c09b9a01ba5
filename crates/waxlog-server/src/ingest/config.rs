//! Ingestion configuration
//!
//! Everything the monthly dump pipeline needs: where dumps live, where they are
//! staged on disk, how often the jobs run and how hard they retry.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::env_or;

/// Public bucket the monthly dumps are published to.
pub const DEFAULT_DUMP_BASE_URL: &str = "https://discogs-data-dumps.s3.us-west-2.amazonaws.com";

/// Local staging directory for downloaded dumps.
pub const DEFAULT_DATA_DIR: &str = "./data/dumps";

/// Download check cadence (daily).
pub const DEFAULT_DOWNLOAD_INTERVAL_SECS: u64 = 86_400;

/// Processing and stuck-record check cadence (15 minutes).
pub const DEFAULT_PROCESSING_INTERVAL_SECS: u64 = 900;

/// A record left in Processing longer than this is reclaimed (2 hours).
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 7_200;

/// Records per upsert round trip.
pub const DEFAULT_BATCH_SIZE: usize = 3_000;

/// Entity files processed in parallel within one month.
pub const DEFAULT_MAX_CONCURRENT_FILES: usize = 4;

/// Failed runs tolerated before a record needs an admin reset.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Per-request HTTP timeout for dump downloads (dump files are large).
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 3_600;

/// Attempts per HTTP request before a transient failure fails the run.
pub const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Whether the scheduled jobs run at all
    pub enabled: bool,
    pub dump_base_url: String,
    pub data_dir: PathBuf,
    pub download_interval_secs: u64,
    pub processing_interval_secs: u64,
    pub stuck_threshold_secs: u64,
    pub batch_size: usize,
    pub max_concurrent_files: usize,
    pub max_retries: i32,
    pub http_timeout_secs: u64,
    pub download_attempts: u32,
    /// Base delay of the exponential backoff between download attempts
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dump_base_url: DEFAULT_DUMP_BASE_URL.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            download_interval_secs: DEFAULT_DOWNLOAD_INTERVAL_SECS,
            processing_interval_secs: DEFAULT_PROCESSING_INTERVAL_SECS,
            stuck_threshold_secs: DEFAULT_STUCK_THRESHOLD_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_files: DEFAULT_MAX_CONCURRENT_FILES,
            max_retries: DEFAULT_MAX_RETRIES,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            download_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            retry_backoff_ms: 1_000,
        }
    }
}

impl IngestConfig {
    /// Load from `INGEST_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            enabled: env_or("INGEST_ENABLED", defaults.enabled),
            dump_base_url: std::env::var("INGEST_DUMP_BASE_URL")
                .unwrap_or(defaults.dump_base_url),
            data_dir: std::env::var("INGEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            download_interval_secs: env_or(
                "INGEST_DOWNLOAD_INTERVAL_SECS",
                defaults.download_interval_secs,
            ),
            processing_interval_secs: env_or(
                "INGEST_PROCESSING_INTERVAL_SECS",
                defaults.processing_interval_secs,
            ),
            stuck_threshold_secs: env_or(
                "INGEST_STUCK_THRESHOLD_SECS",
                defaults.stuck_threshold_secs,
            ),
            batch_size: env_or("INGEST_BATCH_SIZE", defaults.batch_size),
            max_concurrent_files: env_or(
                "INGEST_MAX_CONCURRENT_FILES",
                defaults.max_concurrent_files,
            ),
            max_retries: env_or("INGEST_MAX_RETRIES", defaults.max_retries),
            http_timeout_secs: env_or("INGEST_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            download_attempts: env_or("INGEST_DOWNLOAD_ATTEMPTS", defaults.download_attempts),
            retry_backoff_ms: env_or("INGEST_RETRY_BACKOFF_MS", defaults.retry_backoff_ms),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dump_base_url.is_empty() {
            anyhow::bail!("INGEST_DUMP_BASE_URL cannot be empty");
        }
        if self.batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than 0");
        }
        if self.max_concurrent_files == 0 {
            anyhow::bail!("INGEST_MAX_CONCURRENT_FILES must be greater than 0");
        }
        if self.download_attempts == 0 {
            anyhow::bail!("INGEST_DOWNLOAD_ATTEMPTS must be greater than 0");
        }
        if self.download_interval_secs == 0 || self.processing_interval_secs == 0 {
            anyhow::bail!("Ingestion job intervals must be greater than 0");
        }
        Ok(())
    }

    pub fn download_interval(&self) -> Duration {
        Duration::from_secs(self.download_interval_secs)
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

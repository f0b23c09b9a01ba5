//! Live sync configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::env_or;

pub const DEFAULT_API_BASE_URL: &str = "https://api.discogs.com";

/// Deadline of one relayed request
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Attempts per page before the session fails
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

/// Largest page the API serves
pub const DEFAULT_PER_PAGE: u32 = 100;

/// Authenticated budget: 60 requests per rolling minute
pub const DEFAULT_RATE_LIMIT_REQUESTS: i32 = 60;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub per_page: u32,
    pub rate_limit_requests: i32,
    pub rate_limit_window_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            per_page: DEFAULT_PER_PAGE,
            rate_limit_requests: DEFAULT_RATE_LIMIT_REQUESTS,
            rate_limit_window_secs: DEFAULT_RATE_LIMIT_WINDOW_SECS,
        }
    }
}

impl SyncConfig {
    /// Load from `SYNC_*` and `RATE_LIMIT_*` environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            api_base_url: std::env::var("SYNC_API_BASE_URL").unwrap_or(defaults.api_base_url),
            request_timeout_secs: env_or(
                "SYNC_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            max_retries: env_or("SYNC_MAX_RETRIES", defaults.max_retries),
            backoff_base_ms: env_or("SYNC_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            per_page: env_or("SYNC_PER_PAGE", defaults.per_page),
            rate_limit_requests: env_or("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests),
            rate_limit_window_secs: env_or(
                "RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_base_url.is_empty() {
            anyhow::bail!("SYNC_API_BASE_URL cannot be empty");
        }
        if self.per_page == 0 || self.per_page > 100 {
            anyhow::bail!("SYNC_PER_PAGE must be between 1 and 100");
        }
        if self.max_retries == 0 {
            anyhow::bail!("SYNC_MAX_RETRIES must be greater than 0");
        }
        if self.rate_limit_requests <= 0 || self.rate_limit_window_secs == 0 {
            anyhow::bail!("Rate limit budget and window must be greater than 0");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

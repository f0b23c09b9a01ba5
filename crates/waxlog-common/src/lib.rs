//! Waxlog Common Library
//!
//! Shared building blocks for the Waxlog workspace.
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: streaming SHA-256 verification of dump files
//! - **Logging**: `tracing` subscriber setup driven by `LOG_*` variables
//! - **Types**: dump month keys and catalog entity types
//!
//! # Example
//!
//! ```no_run
//! use waxlog_common::{checksum, types::MonthKey};
//!
//! fn verify(path: &str, expected: &str) -> waxlog_common::Result<()> {
//!     let month: MonthKey = "2025-02".parse()?;
//!     checksum::verify_file_checksum(path, expected)?;
//!     tracing::info!(month_key = %month, "dump file verified");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{CommonError, Result};

//! Waxlog Server Library
//!
//! Keeps a local mirror of the Discogs catalog and of each user's collection.
//!
//! # Overview
//!
//! Two pipelines share this crate:
//!
//! - **Bulk ingestion** ([`ingest`]): once a month Discogs publishes gzipped XML
//!   dumps of artists, labels, masters and releases. A scheduler downloads and
//!   verifies them, then streams each file into batched upserts. Progress for a
//!   month lives in one `ingestion_records` row, so a restart picks up from the
//!   last committed status.
//! - **Live sync** ([`sync`]): a user's collection or wantlist is paged through
//!   the Discogs API. Requests are executed by the user's own browser, relayed
//!   over a WebSocket, and throttled by a per-user rate limiter backed by
//!   Postgres.
//!
//! ## Framework Stack
//!
//! - **Axum**: HTTP routes and the relay WebSocket
//! - **SQLx**: Postgres persistence and migrations
//! - **Tokio**: scheduler, workers and relay plumbing

pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;
pub mod sync;

pub use error::{AppError, AppResult};

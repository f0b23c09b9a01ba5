//! Feature modules implementing the Waxlog API
//!
//! Each feature is a vertical slice with its own `routes.rs`; the logic lives
//! in [`crate::sync`] and [`crate::ingest`].
//!
//! # Features
//!
//! - **sync**: start, inspect, pause, resume and cancel sync sessions
//! - **rate_limit**: the caller's request budget
//! - **downloads**: operator controls for the monthly dump pipeline
//! - **relay**: the WebSocket the browser uses to execute API requests

pub mod downloads;
pub mod rate_limit;
pub mod relay;
pub mod shared;
pub mod sync;

use axum::Router;

use crate::ingest::DownloadAdmin;
use crate::sync::{RateLimiter, RequestRelay, SyncOrchestrator};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    pub orchestrator: SyncOrchestrator,
    pub rate_limiter: RateLimiter,
    pub relay: RequestRelay,
    pub downloads: DownloadAdmin,
}

/// Creates the API router with all feature routes mounted
///
/// - `/sync` - Sync sessions
/// - `/rate-limit` - Per-user request budget
/// - `/admin/downloads` - Dump pipeline controls
/// - `/ws` - Relay WebSocket
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .nest("/sync", sync::sync_routes().with_state(state.orchestrator))
        .nest("/rate-limit", rate_limit::rate_limit_routes().with_state(state.rate_limiter))
        .nest("/admin/downloads", downloads::downloads_routes().with_state(state.downloads))
        .merge(relay::relay_routes().with_state(state.relay))
}

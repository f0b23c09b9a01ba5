//! Live collection and wantlist sync
//!
//! # Architecture
//!
//! - **config**: `SYNC_*` and `RATE_LIMIT_*` settings
//! - **models** / **repository**: `SyncSession`, its status graph and persistence
//! - **rate_limit**: per-user request budget in a shared store
//! - **relay**: request/response correlation over the user's WebSocket
//! - **collection**: page decoding and the user item tables
//! - **events**: progress push events and their broadcaster task
//! - **orchestrator**: one drive task per active session
//!
//! # Public API
//!
//! Routes live in `features::sync`, `features::rate_limit` and `features::relay`:
//! - `POST /api/v1/sync/collection`
//! - `GET /api/v1/sync/status/:id`
//! - `POST /api/v1/sync/:id/{cancel,pause,resume}`
//! - `GET /api/v1/sync/sessions`
//! - `GET /api/v1/rate-limit`, `POST /api/v1/rate-limit/reset`
//! - `GET /api/v1/ws`

pub mod collection;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod rate_limit;
pub mod relay;
pub mod repository;

pub use collection::{CollectionStore, MemoryCollectionStore, PgCollectionStore};
pub use config::SyncConfig;
pub use error::{RelayError, SyncError};
pub use events::{spawn_broadcaster, ProgressEvent, ProgressPublisher};
pub use models::{SyncProgress, SyncSession, SyncSessionId, SyncStatus, SyncType};
pub use orchestrator::SyncOrchestrator;
pub use rate_limit::{MemoryRateLimitStore, PgRateLimitStore, RateLimitBudget, RateLimiter};
pub use relay::RequestRelay;
pub use repository::{MemorySyncSessionRepository, PgSyncSessionRepository, SyncSessionRepository};

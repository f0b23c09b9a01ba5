//! Sync feature module
//!
//! Start, inspect and steer collection and wantlist sync sessions.

pub mod routes;

pub use routes::sync_routes;

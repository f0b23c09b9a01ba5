//! Relay WebSocket endpoint

pub mod routes;

pub use routes::relay_routes;

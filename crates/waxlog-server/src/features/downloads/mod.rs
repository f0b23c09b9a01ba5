//! Dump download administration
//!
//! Operator endpoints over the monthly ingestion pipeline.

pub mod routes;

pub use routes::downloads_routes;

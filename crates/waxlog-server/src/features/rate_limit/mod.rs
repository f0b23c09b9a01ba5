//! Rate limit feature module

pub mod routes;

pub use routes::rate_limit_routes;

//! HTTP server: router and demonstration endpoints.

mod rate_limit_examples;
pub mod routes;

pub use routes::build_router;

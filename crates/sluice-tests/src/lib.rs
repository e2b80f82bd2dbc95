//! Integration test infrastructure for Sluice.
//!
//! Tests drive a real HTTP server bound to an ephemeral port. Database tests
//! additionally start PostgreSQL through testcontainers and only build with
//! the `integration` feature.
//!
//! # Usage
//!
//! ```ignore
//! use sluice_tests::{PipelineFixture, start_test_server};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let server = start_test_server().await.unwrap();
//!     let client = server.client();
//!     client.register(&PipelineFixture::chain("etl")).await.unwrap();
//! }
//! ```

pub mod containers;
pub mod fixtures;
pub mod helpers;

pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,sluice_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}

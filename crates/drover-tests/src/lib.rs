//! Integration test infrastructure for Drover CI.
//!
//! Wires the dispatcher, lifecycle tracker and agent controller together on
//! in-memory adapters.
//!
//! # Usage
//!
//! ```ignore
//! use drover_tests::TestContext;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let ctx = TestContext::new();
//!     ctx.load(vec![PipelineFixture::single("api", &["true"])]);
//!     // Use ctx.dispatcher, ctx.archive, ctx.agent(...), etc.
//! }
//! ```

pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::TestContext;
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,drover_tests=debug")),
        )
        .with_test_writer()
        .try_init();
}

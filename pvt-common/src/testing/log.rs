//! Test logging.
//!
//! ```ignore
//! #[ctor::ctor]
//! fn setup() {
//!     pvt_common::testing::init_test_logging();
//! }
//! ```

use std::sync::Once;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Route tracing output through the test harness writer. Safe to call
/// more than once. `PVT_TEST_LOG_LEVEL` sets the filter (default `debug`).
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("PVT_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = EnvFilter::try_new(format!("pvt={level},pvt_common={level},pvtd={level}"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_test_writer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .compact(),
            )
            .with(filter)
            .try_init();
    });
}

//! Test helpers shared by the testfork crates.
//!
//! ```ignore
//! #[test]
//! fn test_example() {
//!     testfork_common::testing::init_test_logging();
//!     tracing::info!("captured by the test harness");
//! }
//! ```

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary.
///
/// `TESTFORK_TEST_LOG_LEVEL` overrides the default `debug` filter.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let level = std::env::var("TESTFORK_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = EnvFilter::try_new(format!(
            "testforkd={level},testfork_wkr={level},testfork_common={level}"
        ))
        .unwrap_or_else(|_| EnvFilter::new("info"));

        let _ = fmt()
            .with_test_writer()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init();
    });
}

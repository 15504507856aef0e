//! Tracing initialisation helpers for tests.
//!
//! Daemon tests run the transport, the handler and the client in one
//! process, so captured output interleaves all three. Call
//! [`init_test_tracing`] at the top of a test to route it to the test
//! harness; `RUST_LOG` always wins over the fallback directives.
//!
//! The subscriber is installed at most once per process.

use tracing_subscriber::EnvFilter;

/// Quiet by default, with daemon lifecycle events visible.
const DEFAULT_DIRECTIVES: &str = "warn,stagebox_core::daemon=info";

/// Install the test subscriber with the default directives.
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     stagebox_test_utils::tracing_setup::init_test_tracing();
///     tracing::debug!("visible when RUST_LOG=debug");
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_DIRECTIVES);
}

/// Install the test subscriber, falling back to `directives` when
/// `RUST_LOG` is unset or invalid.
pub fn init_test_tracing_with(directives: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directives));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}

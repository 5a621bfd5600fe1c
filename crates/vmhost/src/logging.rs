//! Log output for binaries and tests.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn,vmhost=info";

/// Installs a stdout subscriber filtered by `RUST_LOG`. Thread names are
/// printed, so Isolate lines show up as `isolate-{vm}`.
///
/// Safe to call more than once; only the first call installs anything.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true).with_test_writer())
        .try_init();
}

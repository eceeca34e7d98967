//! Diagnostic tracing for the `shipper` binary.
//!
//! Tracing output goes to stderr and is filtered by `RUST_LOG`. It is separate
//! from the execution records, history and learning files under `.shipper/`,
//! which are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=shipper=debug shipper run todo-1
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

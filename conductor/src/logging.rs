//! Operator diagnostics via `tracing`.
//!
//! - **Tracing (this module)**: controlled by `RUST_LOG`, written to stderr,
//!   never persisted.
//! - **History events**: the product-level audit trail, stored in each work
//!   item document and unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber. Defaults to `warn` if `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=conductor=debug conductor heartbeat --ticks 1
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

//! Development-time tracing for the effect runtime.
//!
//! Lifecycle transitions, contained script faults and generator diagnostics
//! are emitted through `tracing`. Effect `console.*` output is forwarded under
//! the `effect_runtime::script` target, so it can be filtered on its own.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=effect_runtime=debug,effect_runtime::script=info effect-runtime run pulse.js
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

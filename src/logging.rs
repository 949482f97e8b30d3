//! Development-time tracing for debugging the engine.
//!
//! Diagnostics only: workspace files and reports are product output and are
//! never routed through tracing.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` when unset. Output goes to stderr in
/// compact format, so stdout stays clean for command output.
///
/// # Example
/// ```bash
/// RUST_LOG=phasebench=debug phasebench run --task tasks/fizzbuzz --workspace ws
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

//! Diagnostic tracing for the CLI.
//!
//! Diagnostics go to stderr and are filtered by `TASKKERNEL_LOG` (falling back
//! to `RUST_LOG`). They are never part of the audit trail: the event log and
//! evidence bundles are written regardless of the filter, and stdout stays
//! reserved for the JSON results the CLI prints.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "TASKKERNEL_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Install the global subscriber. Defaults to `warn`.
///
/// ```bash
/// TASKKERNEL_LOG=taskkernel=debug taskkernel run t1
/// ```
pub fn init() {
    // A second init (tests driving `run` in-process) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

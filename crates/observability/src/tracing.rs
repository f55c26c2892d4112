//! Tracing/logging initialization.
//!
//! Structured logs on stdout, filtered via `RUST_LOG` (default `info`).
//! `CHRONOS_LOG_FORMAT=text` switches from JSON lines to a human-readable
//! format for local runs.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let text = std::env::var("CHRONOS_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("text"));
    if text {
        let _ = builder.try_init();
    } else {
        let _ = builder.json().try_init();
    }
}

//! # opsa-logging
//!
//! Tracing subscriber setup for the `opsa` binary and in-memory log capture
//! for tests.
//!
//! - [`init_subscriber`]: compact human-readable output on stderr
//! - [`init_json_subscriber`]: one JSON object per line on stderr
//! - [`capture_logs`]: thread-local capture for assertions
//!
//! Both initializers honor `RUST_LOG` when it is set; otherwise the `level`
//! argument is used as the filter directive.

#![deny(unsafe_code)]

pub mod test_utils;

pub use test_utils::{CapturedEvent, CapturedLogs, capture_logs};

use tracing_subscriber::EnvFilter;

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber with compact stderr output.
///
/// Call once at application startup. Subsequent calls are no-ops.
pub fn init_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // set_global_default is a no-op if already set
    let _ = subscriber.try_init();
}

/// Initialize the global tracing subscriber with JSON lines on stderr.
///
/// Call once at application startup. Subsequent calls are no-ops.
pub fn init_json_subscriber(level: &str) {
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_current_span(false)
        .with_writer(std::io::stderr);

    let _ = subscriber.try_init();
}

//! Idempotent tracing-subscriber setup.
//!
//! The library never installs a subscriber on its own; it only emits
//! events. Call [`init_tracing`] (or [`init_tracing_with_filter`]) from
//! an application or a test binary that wants to see them.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `fmt` subscriber honoring `RUST_LOG`, defaulting to
/// `warn` if the variable is unset. Safe to call more than once; only
/// the first call takes effect.
pub fn init_tracing() {
    init_tracing_with_filter("warn");
}

/// Like [`init_tracing`] but with an explicit default filter directive
/// used when `RUST_LOG` is unset.
pub fn init_tracing_with_filter(default_directive: &str) {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

//! Logging setup for the `sbx` binary.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Setting this to anything turns on debug logging.
pub const SBX_DEBUG_ENV: &str = "SBX_DEBUG";

fn default_directives(debug: bool) -> &'static str {
    if debug {
        "sandbox_isolation=debug,warn"
    } else {
        "sandbox_isolation=info,warn"
    }
}

/// Install the stderr subscriber. `RUST_LOG` takes precedence over the
/// level picked from `force_debug` / `SBX_DEBUG`.
pub fn init_debug_logging(force_debug: bool) {
    let debug_enabled = force_debug || std::env::var_os(SBX_DEBUG_ENV).is_some();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug_enabled)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug_enabled)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}

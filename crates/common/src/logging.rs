//! Logging setup for Ravel components.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter directives when RUST_LOG is unset: informational logging
/// from the Ravel crates, warnings from the rest of the dependency tree.
const DEFAULT_DIRECTIVES: &str =
    "warn,ravel=info,system=info,iptables=info,haproxy=info,common=info";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Initialize tracing for a Ravel worker.
///
/// RUST_LOG overrides the default directives when set.
pub fn init() {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(default_filter())
        .init();
}

/// Initialize tracing with JSON output for log collection.
pub fn init_json() {
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(default_filter())
        .init();
}

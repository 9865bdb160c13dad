//! Tracing initialization.
//!
//! Installs a formatted subscriber honoring `RUST_LOG`. Safe to call more
//! than once; later calls are no-ops.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

//! Tracing setup helpers.
//!
//! The engine logs through `tracing`; hosts that already install a
//! subscriber can ignore this module entirely.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a formatted subscriber honoring `RUST_LOG`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Installs a JSON subscriber honoring `RUST_LOG`, for log pipelines.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_json() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().json().with_env_filter(filter).try_init();
}

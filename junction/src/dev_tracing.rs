//! Development/test helper for structured logging.
//!
//! Mirrors the original distribution's `configure_logging` convenience call:
//! a thin `tracing_subscriber` setup benches and integration tests can reach
//! for without each hand-rolling `EnvFilter` plumbing.

/// Initialize a fmt subscriber from `RUST_LOG`. No-op if unset or a global
/// subscriber is already installed.
pub fn init() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Initialize with an explicit filter directive, ignoring `RUST_LOG`.
pub fn init_with_filter(directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(directive))
        .try_init();
}

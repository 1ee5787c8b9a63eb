//! Logging and tracing initialization.
//!
//! The engine emits `tracing` events; nothing shows until a subscriber is
//! installed. Call one of these once at startup, before creating the
//! host. The `RUST_LOG` environment variable overrides any level passed
//! here (e.g. `RUST_LOG=etude_core=debug`).

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with sensible defaults (`info` unless `RUST_LOG`
/// says otherwise).
///
/// # Panics
///
/// Panics if a subscriber was already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging at a specific level.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

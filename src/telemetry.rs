//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Install a compact fmt subscriber filtered by `RUST_LOG`, or by
/// `default_level` when `RUST_LOG` is unset or invalid.
///
/// Returns `false` when a global subscriber was already installed, so
/// calling it from several tests or binaries is harmless.
///
/// ```ignore
/// outbox_relay::telemetry::init_tracing("info");
/// tracing::info!("Relay started");
/// ```
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}

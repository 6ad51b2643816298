//! Bootstrap utilities for the transfer-audit binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the TRANSFER_AUDIT_LOG environment variable.
///
/// Defaults to "info" level if TRANSFER_AUDIT_LOG is not set. Must run
/// before the listener is forked so both processes log the same way.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

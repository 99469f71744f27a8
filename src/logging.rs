//! Logging initialization.
//!
//! The log level is controlled by the `RUST_LOG` environment variable:
//!
//! ```bash
//! RUST_LOG=debug ravel ravel.toml   # per-event tracing
//! RUST_LOG=warn ravel ravel.toml    # warnings and errors only
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber with sensible defaults.
///
/// Call once at startup, before the server is constructed. Defaults to
/// `info` when `RUST_LOG` is unset. Repeated calls are ignored so tests can
/// initialize logging without coordinating.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

//! Tracing subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `config.level`; an unparsable level falls back to
/// `info`. Returns `false` if a subscriber was already installed, in which
/// case nothing changes.
pub fn init_tracing(config: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if config.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(level = %config.level, json = config.json, "tracing initialized");
    }
    installed
}

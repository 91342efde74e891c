//! Tracing subscriber setup
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! left to the embedding application through [`init`] or [`init_with`].

use crate::core::config::LoggingConfig;
use crate::core::error::Result;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber with the default logging configuration.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once is harmless.
pub fn init() -> Result<()> {
    init_with(&LoggingConfig::default())
}

/// Install a global fmt subscriber for the given logging configuration
pub fn init_with(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match config.format.as_str() {
        "pretty" => builder.pretty().try_init(),
        _ => builder.compact().try_init(),
    };

    match installed {
        Ok(()) => tracing::info!("Initializing {} v{}", crate::NAME, crate::VERSION),
        Err(e) => tracing::debug!("Subscriber already installed: {}", e),
    }
    Ok(())
}

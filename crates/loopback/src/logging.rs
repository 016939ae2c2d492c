//! Logging setup

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Level implied by the `--debug` verbosity, if any
pub fn level_for_debug(debug: u32) -> Option<&'static str> {
    match debug {
        0 => None,
        1 => Some("debug"),
        _ => Some("trace"),
    }
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` wins over `default_level`.
pub fn setup_logging(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("Invalid log filter: {}", e))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| anyhow!("Logging already initialized: {}", e))?;

    Ok(())
}

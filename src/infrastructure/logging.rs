//! Logging infrastructure.
//!
//! Structured logging via tracing. `RUST_LOG` wins over the configured
//! level when set; format is json or pretty per the logging config.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::domain::models::config::LoggingConfig;

/// Initialize the global tracing subscriber from the merged config.
///
/// Safe to call once per process; a second call returns an error from the
/// underlying subscriber registration.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match config.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init logging: {err}"))?,
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init logging: {err}"))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_accepts_default_config() {
        // First registration in the test process wins; both outcomes are fine
        // here, the point is that init does not panic on valid input.
        let _ = init(&LoggingConfig::default());
        assert!(init(&LoggingConfig::default()).is_err());
    }
}

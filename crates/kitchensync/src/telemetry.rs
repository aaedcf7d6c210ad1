//! Tracing initialization for the kitchensync binary.
//!
//! `RUST_LOG` wins over the configured level when set.

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Build the filter: `RUST_LOG` if present and valid, otherwise `log_level`.
pub fn filter(log_level: &str) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level '{}'", log_level)),
    }
}

/// Install the global fmt subscriber. Call once.
pub fn init(log_level: &str) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(log_level)?)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_levels_and_directives() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        assert!(filter("debug").is_ok());
        assert!(filter("kitchensync=trace,info").is_ok());
    }
}

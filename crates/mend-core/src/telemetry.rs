//! Logging setup for processes embedding the healing loop.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset (e.g. "mend=info").
    pub filter: String,
    /// Emit one JSON object per event instead of human-readable lines.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "mend_core=info,mend_runner=info".into(),
            json: false,
        }
    }
}

impl LogConfig {
    /// `RUST_LOG` if set and valid, otherwise the configured directive.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.filter)
                .with_context(|| format!("invalid log filter '{}'", self.filter)),
        }
    }
}

/// Install the global subscriber. Fails (rather than panicking) if one is
/// already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.env_filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

use crate::Result;
use serde::Deserialize;

/// Configuration for logging and tracing.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Format for log output. The default is the "full" human-readable
    /// format; `json`, `compact`, and `pretty` are also available.
    #[serde(default)]
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Installs a tracing subscriber for the configured format.
    ///
    /// Filtering comes from `RUST_LOG`. Safe to call more than once; later
    /// calls are no-ops, which keeps tests from fighting over the global
    /// subscriber.
    pub fn init(&self) {
        use tracing_subscriber::{EnvFilter, prelude::*};
        let env_filter = EnvFilter::from_default_env();
        match self.format {
            LogFormat::Json => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().json())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Default => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Compact => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().compact())
                    .with(env_filter)
                    .try_init();
            }
            LogFormat::Pretty => {
                let _ = tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .with(env_filter)
                    .try_init();
            }
        }
    }
}

/// Log output format.
///
/// # TOML Values
///
/// Use lowercase names in configuration: `json`, `default`, `compact`,
/// `pretty`.
#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Structured JSON, one object per line. Recommended for production with
    /// centralized log aggregation.
    Json,

    /// Human-readable format with full details.
    #[default]
    Default,

    /// Compact single-line format.
    Compact,

    /// Multi-line format with indentation, for examining detailed logs during
    /// development.
    Pretty,
}

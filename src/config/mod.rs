//!
//! Configuration structures and utilities for wiring up the middleware.
//!
//! A configuration can be created in several ways:
//! - From an environment-specific TOML file via `Config::from_rust_env` or
//!   `Config::from_toml_file`
//! - From a TOML string via `Config::from_toml`
//! - Constructed programmatically via the builder methods on `Config`
//!
//! In the TOML-based methods, environment variables can be referenced using
//! the `{{ VAR_NAME }}` syntax and are substituted before parsing, which
//! keeps connection strings and credentials out of the files themselves.
//!
//! Configuration is split into logical sections, each with its own struct:
//!
//! - `IdempotencyConfig` for the interceptor (mode, key header, TTLs, lock
//!   retry budget, hot cache, oversell guard)
//! - `StorageConfig` for the durable record store
//! - `LockConfig` for the per-key lock backend
//! - `LoggingConfig` for logging and tracing
//!

mod idempotency;
mod lock;
mod logging;
mod storage;

pub use idempotency::*;
pub use lock::*;
pub use logging::*;
pub use storage::*;

use crate::{Error, Result};
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{env, fs, path::Path, str::FromStr, sync::LazyLock};

/// Matches handlebars-style environment variable references like
/// `{{ VAR_NAME }}`, with optional whitespace around the name.
static HANDLEBAR_REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Z0-9_]+)\s*\}\}").unwrap());

/// Top-level configuration for the idempotency middleware and its backends.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    ///
    /// Loads the configuration from a file based on the RUST_ENV environment
    /// variable: `config/{RUST_ENV}.toml`.
    ///
    pub fn from_rust_env() -> Result<Config> {
        Self::from_toml_file(env::var("RUST_ENV")?)
    }

    ///
    /// Given an environment name, loads `config/{env}.toml`, substitutes any
    /// environment variables, and returns a Config.
    ///
    pub fn from_toml_file(env: impl AsRef<str>) -> Result<Config> {
        Self::from_path(format!("config/{}.toml", env.as_ref()))
    }

    ///
    /// Loads a configuration from an explicit file path.
    ///
    pub fn from_path(path: impl AsRef<Path>) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    ///
    /// Parses a configuration string in TOML format.
    ///
    pub fn from_toml(toml_str: &str) -> Result<Config> {
        toml_str.parse()
    }

    /// Sets the interceptor section wholesale.
    pub fn with_idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// Sets the key-handling mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.idempotency.mode = mode;
        self
    }

    /// Sets the HTTP header carrying the idempotency key.
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.idempotency.header_name = name.into();
        self
    }

    /// Sets the replay record lifetime.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.idempotency.ttl = ttl;
        self
    }

    /// Sets the storage backend selection.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Sets the lock backend selection.
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Enables or disables the oversell guard.
    pub fn with_oversell_protection(mut self, enabled: bool) -> Self {
        self.idempotency.oversell_protection = enabled;
        self
    }

    /// Sets the log format.
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.logging.format = format;
        self
    }

    /// Ensures that the configuration is valid.
    ///
    /// Most values are optional or have sensible defaults; here the few
    /// required invariants are enforced. A failure is a deployment problem,
    /// not a per-request condition.
    pub fn validate(&self) -> Result<()> {
        self.idempotency.validate()?;
        self.storage.validate()?;
        self.lock.validate()?;
        self.logging.validate()?;
        Ok(())
    }

    ///
    /// Sets up the tracing subscriber based on the LoggingConfig.
    ///
    /// Call early during startup so logging is configured before any
    /// messages are emitted.
    ///
    pub fn setup_tracing(&self) {
        self.logging.init();
    }
}

///
/// Parses a configuration string with references to environment variables by
/// substituting them and then parsing the resulting TOML.
///
impl FromStr for Config {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let config_file = replace_handlebars_with_env(s);
        let config = toml::from_str::<Config>(&config_file)?;
        Ok(config)
    }
}

/// Replaces `{{ VAR_NAME }}` placeholders with environment variable values.
///
/// Missing variables are substituted with an empty string (and logged), so a
/// forgotten export fails validation instead of producing a panic here.
pub fn replace_handlebars_with_env(input: &str) -> String {
    HANDLEBAR_REGEXP
        .replace_all(input, |caps: &Captures| {
            let var_name = &caps[1];
            env::var(var_name).unwrap_or_else(|_| {
                tracing::warn!(
                    variable = %var_name,
                    "Environment variable not found, substituting with empty string"
                );
                String::new()
            })
        })
        .to_string()
}

use crate::Result;
use serde::Deserialize;
use std::time::Duration;

/// How the interceptor treats requests without an idempotency key, and
/// whether fresh responses are stored.
///
/// | Mode | Missing key | Store on success |
/// |------|-------------|------------------|
/// | `Strict` | reject with 400 | yes |
/// | `Optional` | pass through | yes |
/// | `Lax` | pass through | no (replay check only) |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Mutating requests must carry a key.
    #[default]
    Strict,
    /// Keyless requests bypass idempotency entirely.
    Optional,
    /// Keyless requests bypass; keyed requests are checked for replays but
    /// fresh responses are never stored.
    Lax,
}

/// Configuration for the hot "recent-seen" cache tier.
///
/// The hot cache is positive-only: a hit means a record exists (or was just
/// written) and the lock can be skipped in favor of a direct storage read;
/// a miss carries no information.
#[derive(Debug, Clone, Deserialize)]
pub struct FastCacheConfig {
    /// Whether the hot cache is consulted at all. Default: true.
    #[serde(default = "FastCacheConfig::default_enabled")]
    pub enabled: bool,

    /// Lifetime of a hot-cache entry. Kept short (a few seconds) so the tier
    /// only absorbs thundering-herd retry bursts. Default: 3 seconds.
    #[serde(default = "FastCacheConfig::default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of keys tracked in the local tier; oldest entries are
    /// evicted beyond this. Default: 10000.
    #[serde(default = "FastCacheConfig::default_max_entries")]
    pub max_entries: usize,
}

impl FastCacheConfig {
    fn default_enabled() -> bool {
        true
    }
    fn default_ttl() -> Duration {
        Duration::from_secs(3)
    }
    fn default_max_entries() -> usize {
        10_000
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

impl Default for FastCacheConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            ttl: Self::default_ttl(),
            max_entries: Self::default_max_entries(),
        }
    }
}

/// Per-interceptor configuration.
///
/// # Example
///
/// ```toml
/// [idempotency]
/// mode = "strict"
/// header_name = "X-Idempotency-Key"
/// ttl = "24h"
/// lock_ttl = "30s"
/// max_lock_attempts = 3
/// lock_retry_delay = "150ms"
/// oversell_protection = true
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencyConfig {
    /// Key-handling mode. Default: strict.
    #[serde(default)]
    pub mode: Mode,

    /// HTTP header carrying the idempotency key. Default: `X-Idempotency-Key`.
    #[serde(default = "IdempotencyConfig::default_header_name")]
    pub header_name: String,

    /// JSON body field accepted as a fallback when the header is absent on a
    /// POST request. Default: `idempotency_key`.
    #[serde(default = "IdempotencyConfig::default_body_field")]
    pub body_field: String,

    /// Lifetime of stored replay records. Default: 24 hours.
    #[serde(default = "IdempotencyConfig::default_ttl", with = "humantime_serde")]
    pub ttl: Duration,

    /// Lifetime of the per-key lock. Bounds how long a crashed holder can
    /// keep a key busy; the business handler must complete within it.
    /// Default: 30 seconds.
    #[serde(
        default = "IdempotencyConfig::default_lock_ttl",
        with = "humantime_serde"
    )]
    pub lock_ttl: Duration,

    /// How many times to attempt the lock before answering 429. Default: 3.
    #[serde(default = "IdempotencyConfig::default_max_lock_attempts")]
    pub max_lock_attempts: u32,

    /// Sleep between lock attempts. Default: 150 ms.
    #[serde(
        default = "IdempotencyConfig::default_lock_retry_delay",
        with = "humantime_serde"
    )]
    pub lock_retry_delay: Duration,

    /// Enables the atomic stock-decrement guard for requests carrying
    /// `product_id` and `quantity`. Default: false.
    #[serde(default)]
    pub oversell_protection: bool,

    /// Minimum interval between opportunistic cleanup passes triggered from
    /// the request path. Zero disables them. Default: 1 hour.
    #[serde(
        default = "IdempotencyConfig::default_cleanup_interval",
        with = "humantime_serde"
    )]
    pub cleanup_interval: Duration,

    /// Maximum expired records removed per cleanup pass. Default: 1000.
    #[serde(default = "IdempotencyConfig::default_cleanup_batch")]
    pub cleanup_batch: usize,

    /// Hot-cache tier settings.
    #[serde(default)]
    pub fast_cache: FastCacheConfig,
}

impl IdempotencyConfig {
    fn default_header_name() -> String {
        "X-Idempotency-Key".to_string()
    }
    fn default_body_field() -> String {
        "idempotency_key".to_string()
    }
    fn default_ttl() -> Duration {
        Duration::from_secs(24 * 3600)
    }
    fn default_lock_ttl() -> Duration {
        Duration::from_secs(30)
    }
    fn default_max_lock_attempts() -> u32 {
        3
    }
    fn default_lock_retry_delay() -> Duration {
        Duration::from_millis(150)
    }
    fn default_cleanup_interval() -> Duration {
        Duration::from_secs(3600)
    }
    fn default_cleanup_batch() -> usize {
        1000
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }
    pub fn with_body_field(mut self, field: impl Into<String>) -> Self {
        self.body_field = field.into();
        self
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }
    pub fn with_max_lock_attempts(mut self, attempts: u32) -> Self {
        self.max_lock_attempts = attempts;
        self
    }
    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }
    pub fn with_oversell_protection(mut self, enabled: bool) -> Self {
        self.oversell_protection = enabled;
        self
    }
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
    pub fn with_fast_cache(mut self, fast_cache: FastCacheConfig) -> Self {
        self.fast_cache = fast_cache;
        self
    }

    pub fn validate(&self) -> Result<()> {
        use crate::Error;

        if self.header_name.trim().is_empty() {
            return Err(Error::config("idempotency.header_name must not be empty"));
        }
        if http::header::HeaderName::from_bytes(self.header_name.as_bytes()).is_err() {
            return Err(Error::config(format!(
                "idempotency.header_name {:?} is not a valid HTTP header name",
                self.header_name
            )));
        }
        if self.ttl.is_zero() {
            return Err(Error::config("idempotency.ttl must be greater than zero"));
        }
        if self.lock_ttl.is_zero() {
            return Err(Error::config(
                "idempotency.lock_ttl must be greater than zero",
            ));
        }
        if self.max_lock_attempts == 0 {
            return Err(Error::config(
                "idempotency.max_lock_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            header_name: Self::default_header_name(),
            body_field: Self::default_body_field(),
            ttl: Self::default_ttl(),
            lock_ttl: Self::default_lock_ttl(),
            max_lock_attempts: Self::default_max_lock_attempts(),
            lock_retry_delay: Self::default_lock_retry_delay(),
            oversell_protection: false,
            cleanup_interval: Self::default_cleanup_interval(),
            cleanup_batch: Self::default_cleanup_batch(),
            fast_cache: FastCacheConfig::default(),
        }
    }
}

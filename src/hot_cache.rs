//! Positive-only "recent-seen" cache that short-circuits the lock-and-fetch
//! path for thundering-herd replays.
//!
//! Two tiers: a per-process map, and an optional shared tier with the same
//! tiny TTL for deployments with many replicas. A hit only means "a record
//! exists or was just written, so skip the lock and read storage directly".
//! A miss carries no information; the cache is never used to prove absence,
//! so shared-tier failures degrade to a miss instead of an error.

use crate::{FastCacheConfig, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// The shared tier: a remote presence flag with a short TTL.
#[async_trait]
pub trait SharedHotTier: Send + Sync + 'static {
    /// Marks the key as recently seen for `ttl`.
    async fn mark(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Returns true iff the key was marked within its TTL.
    async fn seen(&self, key: &str) -> Result<bool>;
}

/// The two-tier hot cache.
pub struct HotCache {
    enabled: bool,
    ttl: Duration,
    max_entries: usize,
    local: DashMap<String, Instant>,
    shared: Option<Arc<dyn SharedHotTier>>,
}

impl HotCache {
    /// Builds a cache from the fast-cache configuration, local tier only.
    pub fn new(config: &FastCacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            local: DashMap::new(),
            shared: None,
        }
    }

    /// Attaches a shared tier.
    pub fn with_shared_tier(mut self, shared: Arc<dyn SharedHotTier>) -> Self {
        self.shared = Some(shared);
        self
    }

    /// Records that a replay record for `key` exists right now.
    ///
    /// Best-effort: a shared-tier failure is logged and dropped, because the
    /// cache is advisory.
    pub async fn warm(&self, key: &str) {
        if !self.enabled {
            return;
        }
        self.insert_local(key);
        if let Some(shared) = &self.shared
            && let Err(err) = shared.mark(key, self.ttl).await
        {
            tracing::warn!(key, error = %err, "shared hot-cache mark failed");
        }
    }

    /// Returns true iff the key was recently seen in either tier.
    pub async fn seen(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let now = Instant::now();
        if let Some(deadline) = self.local.get(key) {
            if now < *deadline {
                return true;
            }
            drop(deadline);
            self.local.remove_if(key, |_, d| now >= *d);
        }
        if let Some(shared) = &self.shared {
            match shared.seen(key).await {
                Ok(true) => {
                    // Pull the hit into the local tier for the next retry.
                    self.insert_local(key);
                    return true;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(key, error = %err, "shared hot-cache check failed");
                }
            }
        }
        false
    }

    /// Drops expired local entries.
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.local.retain(|_, deadline| now < *deadline);
    }

    fn insert_local(&self, key: &str) {
        if self.local.len() >= self.max_entries {
            self.cleanup_expired();
            if self.local.len() >= self.max_entries
                && let Some(oldest) = self
                    .local
                    .iter()
                    .min_by_key(|e| *e.value())
                    .map(|e| e.key().clone())
            {
                self.local.remove(&oldest);
            }
        }
        self.local.insert(key.to_string(), Instant::now() + self.ttl);
    }
}

/// Redis implementation of the shared tier.
#[cfg(feature = "redis")]
pub struct RedisHotTier {
    conn: redis::aio::ConnectionManager,
    key_prefix: String,
}

#[cfg(feature = "redis")]
impl RedisHotTier {
    /// Connects to the server; flags live under `{prefix}:hot:{key}`.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn flag_key(&self, key: &str) -> String {
        format!("{}:hot:{}", self.key_prefix, key)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl SharedHotTier for RedisHotTier {
    async fn mark(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(self.flag_key(key))
            .arg(1)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn seen(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.flag_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(found == 1)
    }
}

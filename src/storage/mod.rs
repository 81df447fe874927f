//! Durable `key → record` storage with TTL.
//!
//! All backends honor the same contract:
//!
//! | Op | Semantics |
//! |----|-----------|
//! | `put` | create-if-absent within the TTL window; true on first insert, false when an unexpired record already exists; never overwrites a live record |
//! | `get` | the record iff present and not expired |
//! | `exists` | cheap liveness predicate, consistent with `get` modulo expiry between calls |
//! | `delete` | unconditional removal; true iff a live record was removed |
//! | `multi_get` | bulk `get`, absent keys omitted from the result map |
//! | `cleanup` | removes up to `batch_max` expired records, returns the count; safe concurrently with the request path |
//!
//! `put` against an expired row is a fresh insert. Transient failures surface
//! as `Backend` errors; the interceptor maps them to 5xx before the handler
//! runs and logs-and-swallows them after.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
#[cfg(feature = "redis")]
pub use redis::RedisStorage;

use crate::{Result, StorageConfig, record::StoredRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};

/// Point-in-time statistics a backend can report, for the `stats` CLI command.
///
/// Counts a backend cannot compute cheaply are `None`, not fabricated.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Backend name (`memory`, `redis`, `postgres`).
    pub backend: String,
    /// Records currently live (unexpired), when countable.
    pub live: Option<u64>,
    /// Records present but expired and awaiting cleanup, when countable.
    pub expired: Option<u64>,
}

/// The storage backend contract. See the module docs for semantics.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Create-if-absent. Returns true on first insert within the TTL window.
    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<bool>;

    /// Returns the record iff present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>>;

    /// Cheap liveness predicate.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Unconditional removal. Returns true iff a live record was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Bulk `get`; absent keys are omitted.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, StoredRecord>>;

    /// Removes up to `batch_max` expired records; returns the deletion count.
    async fn cleanup(&self, batch_max: usize) -> Result<u64>;

    /// Round-trip connectivity check, for diagnostics.
    async fn ping(&self) -> Result<()>;

    /// Point-in-time statistics.
    async fn stats(&self) -> Result<StorageStats>;
}

/// Builds the storage backend selected by the configuration.
///
/// Selecting a backend whose cargo feature is not compiled in is a
/// configuration error, reported at startup rather than per request.
pub async fn from_config(config: &StorageConfig) -> Result<Arc<dyn Storage>> {
    config.validate()?;
    match config {
        StorageConfig::Memory { max_entries } => Ok(Arc::new(MemoryStorage::new(*max_entries))),

        #[cfg(feature = "redis")]
        StorageConfig::Redis {
            url,
            key_prefix,
            compress,
            index_max,
        } => Ok(Arc::new(
            RedisStorage::connect(url, key_prefix, *compress, *index_max).await?,
        )),
        #[cfg(not(feature = "redis"))]
        StorageConfig::Redis { .. } => Err(crate::Error::config(
            "storage backend \"redis\" requires the `redis` cargo feature",
        )),

        #[cfg(feature = "postgres")]
        StorageConfig::Postgres { url, max_pool_size } => {
            Ok(Arc::new(PostgresStorage::connect(url, *max_pool_size)?))
        }
        #[cfg(not(feature = "postgres"))]
        StorageConfig::Postgres { .. } => Err(crate::Error::config(
            "storage backend \"postgres\" requires the `postgres` cargo feature",
        )),
    }
}

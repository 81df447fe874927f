//! Short-lived mutually-exclusive advisory locks, one per idempotency key.
//!
//! Locks self-expire at their TTL; holders do not renew. Every acquisition
//! mints a fresh [`LockToken`] owned by the acquiring caller, and `release`
//! only succeeds when the stored token matches — a holder whose lock expired
//! and was re-acquired by someone else cannot release the new holder's lock.

mod file;
mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use file::FileKeyLock;
pub use memory::MemoryKeyLock;
#[cfg(feature = "redis")]
pub use redis::RedisKeyLock;

use crate::{LockConfig, Result, record::unix_now};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};

/// A per-acquisition proof of ownership: cryptographically random bits plus
/// the acquisition timestamp, formatted as an opaque string.
///
/// Tokens live in the acquiring caller for exactly the critical section; on a
/// crash, TTL expiry is the recovery mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Mints a fresh token.
    pub(crate) fn fresh() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        Self(format!("{:032x}-{millis:x}", rand::random::<u128>()))
    }

    /// The token's wire form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lock backend contract.
#[async_trait]
pub trait KeyLock: Send + Sync + 'static {
    /// Attempts to take the lock. `Some(token)` iff this caller now holds it.
    ///
    /// Does not block on other holders beyond any backend-internal spin (the
    /// file backend's bounded wait); retrying across attempts is the
    /// caller's policy.
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Releases the lock iff `token` still matches the stored one. Returns
    /// true when this call released it; false is a no-op (expired and
    /// re-acquired, or never held).
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool>;

    /// Observational check; may race with concurrent holders.
    async fn is_locked(&self, key: &str) -> Result<bool>;

    /// All-or-nothing multi-key acquisition. On partial success the locks
    /// already taken are released before returning `None`.
    async fn acquire_all(&self, keys: &[String], ttl: Duration) -> Result<Option<Vec<LockToken>>> {
        let mut taken: Vec<(String, LockToken)> = Vec::with_capacity(keys.len());
        for key in keys {
            match self.acquire(key, ttl).await {
                Ok(Some(token)) => taken.push((key.clone(), token)),
                Ok(None) => {
                    self.release_all(&taken).await?;
                    return Ok(None);
                }
                Err(err) => {
                    self.release_all(&taken).await?;
                    return Err(err);
                }
            }
        }
        Ok(Some(taken.into_iter().map(|(_, token)| token).collect()))
    }

    /// Releases each `(key, token)` pair, ignoring individual mismatches.
    async fn release_all(&self, pairs: &[(String, LockToken)]) -> Result<()> {
        for (key, token) in pairs {
            self.release(key, token).await?;
        }
        Ok(())
    }
}

/// Builds the lock backend selected by the configuration.
pub async fn from_config(config: &LockConfig) -> Result<Arc<dyn KeyLock>> {
    config.validate()?;
    match config {
        LockConfig::Memory => Ok(Arc::new(MemoryKeyLock::new())),

        #[cfg(feature = "redis")]
        LockConfig::Redis { url, key_prefix } => {
            Ok(Arc::new(RedisKeyLock::connect(url, key_prefix).await?))
        }
        #[cfg(not(feature = "redis"))]
        LockConfig::Redis { .. } => Err(crate::Error::config(
            "lock backend \"redis\" requires the `redis` cargo feature",
        )),

        LockConfig::File {
            dir,
            style,
            spin_interval,
            max_wait,
        } => Ok(Arc::new(FileKeyLock::new(
            dir,
            *style,
            *spin_interval,
            *max_wait,
        )?)),
    }
}

/// Unix-seconds deadline `ttl` from now, for expiry stamps.
pub(crate) fn expiry_stamp(ttl: Duration) -> u64 {
    unix_now() + ttl.as_secs().max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        let a = LockToken::fresh();
        let b = LockToken::fresh();
        assert_ne!(a, b);
        assert_eq!(a.as_str(), a.to_string());
    }

    #[tokio::test]
    async fn test_from_config_memory() {
        let lock = from_config(&LockConfig::Memory).await.unwrap();
        let token = lock.acquire("k", Duration::from_secs(5)).await.unwrap();
        assert!(token.is_some());
    }

    #[tokio::test]
    async fn test_acquire_all_is_all_or_nothing() {
        let lock = MemoryKeyLock::new();
        let ttl = Duration::from_secs(10);

        // Hold "b" so the batch cannot complete.
        let blocker = lock.acquire("b", ttl).await.unwrap().unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert!(lock.acquire_all(&keys, ttl).await.unwrap().is_none());

        // "a" must have been rolled back.
        assert!(!lock.is_locked("a").await.unwrap());
        assert!(lock.is_locked("b").await.unwrap());

        lock.release("b", &blocker).await.unwrap();
        let tokens = lock.acquire_all(&keys, ttl).await.unwrap().unwrap();
        assert_eq!(tokens.len(), 3);
    }
}

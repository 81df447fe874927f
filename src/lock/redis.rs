//! Redis lock backend.
//!
//! Acquisition is `SET key token NX EX ttl`; release runs a compare-and-delete
//! script so only the holder whose token is still stored can free the key.
//! Redis expires the key at the TTL, which is the crash-recovery path.

use super::{KeyLock, LockToken};
use crate::Result;
use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::time::Duration;

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Locks over a Redis (or compatible) server.
pub struct RedisKeyLock {
    conn: ConnectionManager,
    key_prefix: String,
    release_script: Script,
}

impl RedisKeyLock {
    /// Connects to the server and prepares the release script.
    pub async fn connect(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KeyLock for RedisKeyLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::fresh();
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(token.as_str())
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(set.map(|_| token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release_script
            .key(self.lock_key(key))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.lock_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(found == 1)
    }
}

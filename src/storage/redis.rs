//! Redis storage backend.
//!
//! `put` runs a server-side Lua script so create-if-absent, `EXPIRE`, and the
//! cleanup-index update are a single atomic step. Values are wire-encoded
//! (`version || payload`, optionally gzip). The sorted-set index maps record
//! keys to creation timestamps and exists only to make `cleanup` cheap; it is
//! capped, evicting oldest entries first, and is never consulted on the read
//! path.

use super::{Storage, StorageStats};
use crate::{
    Result,
    record::{StoredRecord, unix_now},
};
use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use std::{collections::HashMap, time::Duration};

/// Create-if-absent with TTL and index maintenance.
///
/// Returns 1 when the value was written, 0 when a live record already exists.
/// Replay detection deliberately does NOT ride on this return: the caller
/// follows up with a `get`, so "I just wrote" and "someone else's record
/// exists" stay distinct.
const PUT_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', tonumber(ARGV[2]))
redis.call('ZADD', KEYS[2], tonumber(ARGV[3]), KEYS[1])
local size = redis.call('ZCARD', KEYS[2])
local cap = tonumber(ARGV[4])
if size > cap then
  redis.call('ZREMRANGEBYRANK', KEYS[2], 0, size - cap - 1)
end
return 1
";

/// Storage over a Redis (or compatible) server.
pub struct RedisStorage {
    conn: ConnectionManager,
    key_prefix: String,
    compress: bool,
    index_max: u64,
    put_script: Script,
}

impl RedisStorage {
    /// Connects to the server and prepares the scripts.
    pub async fn connect(
        url: &str,
        key_prefix: &str,
        compress: bool,
        index_max: u64,
    ) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            compress,
            index_max: index_max.max(1),
            put_script: Script::new(PUT_SCRIPT),
        })
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}:keys:index", self.key_prefix)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<bool> {
        let payload = record.encode(self.compress)?;
        let mut conn = self.conn.clone();
        let written: i64 = self
            .put_script
            .key(self.record_key(key))
            .key(self.index_key())
            .arg(payload)
            .arg(ttl.as_secs().max(1))
            .arg(record.created_at)
            .arg(self.index_max)
            .invoke_async(&mut conn)
            .await?;
        Ok(written == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.record_key(key))
            .query_async(&mut conn)
            .await?;
        match data {
            None => Ok(None),
            Some(bytes) => {
                let record = StoredRecord::decode(&bytes)?;
                // Redis expiry is authoritative, but never hand out a record
                // whose own window has closed.
                if record.is_expired(unix_now()) {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.record_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(found == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let record_key = self.record_key(key);
        let removed: i64 = redis::cmd("DEL")
            .arg(&record_key)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("ZREM")
            .arg(self.index_key())
            .arg(&record_key)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, StoredRecord>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.record_key(key));
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;

        let now = unix_now();
        let mut out = HashMap::new();
        for (key, value) in keys.iter().zip(values) {
            if let Some(bytes) = value {
                let record = StoredRecord::decode(&bytes)?;
                if !record.is_expired(now) {
                    out.insert(key.clone(), record);
                }
            }
        }
        Ok(out)
    }

    async fn cleanup(&self, batch_max: usize) -> Result<u64> {
        if batch_max == 0 {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let index_key = self.index_key();
        // Oldest-first scan of the index; record TTLs have already pruned the
        // values themselves, so cleanup means dropping dangling index entries.
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&index_key)
            .arg(0)
            .arg(batch_max as isize - 1)
            .query_async(&mut conn)
            .await?;

        let mut removed = 0u64;
        for member in members {
            let alive: i64 = redis::cmd("EXISTS")
                .arg(&member)
                .query_async(&mut conn)
                .await?;
            if alive == 0 {
                let _: i64 = redis::cmd("ZREM")
                    .arg(&index_key)
                    .arg(&member)
                    .query_async(&mut conn)
                    .await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(crate::Error::backend(format!(
                "unexpected PING response: {pong}"
            )))
        }
    }

    async fn stats(&self) -> Result<StorageStats> {
        let mut conn = self.conn.clone();
        let tracked: i64 = redis::cmd("ZCARD")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        // The index over-counts by records that expired since the last
        // cleanup, so it is reported as the live upper bound and expired is
        // left unknown.
        Ok(StorageStats {
            backend: "redis".to_string(),
            live: Some(tracked.max(0) as u64),
            expired: None,
        })
    }
}

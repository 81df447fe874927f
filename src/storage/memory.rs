//! In-process storage backend.
//!
//! Good for tests and single-node deployments. Expiry is tracked with
//! monotonic deadlines so sub-second TTLs behave; the capacity cap evicts the
//! oldest records first, so a burst of fresh keys cannot grow the map without
//! bound.

use super::{Storage, StorageStats};
use crate::{Result, record::StoredRecord};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

struct Entry {
    record: StoredRecord,
    deadline: Instant,
}

/// DashMap-backed storage with TTL and a capacity cap.
pub struct MemoryStorage {
    records: DashMap<String, Entry>,
    max_entries: usize,
}

impl MemoryStorage {
    /// Creates a store capped at `max_entries` records.
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    fn evict_if_full(&self) {
        if self.records.len() < self.max_entries {
            return;
        }
        let now = Instant::now();
        self.records.retain(|_, e| now < e.deadline);

        if self.records.len() >= self.max_entries
            && let Some(oldest_key) = self
                .records
                .iter()
                .min_by_key(|e| e.deadline)
                .map(|e| e.key().clone())
        {
            self.records.remove(&oldest_key);
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, record: &StoredRecord, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        self.evict_if_full();

        // The entry API holds the shard lock, making check-then-insert atomic.
        match self.records.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now < occupied.get().deadline {
                    return Ok(false);
                }
                occupied.insert(Entry {
                    record: record.clone(),
                    deadline: now + ttl,
                });
                Ok(true)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Entry {
                    record: record.clone(),
                    deadline: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>> {
        let now = Instant::now();
        if let Some(entry) = self.records.get(key) {
            if now < entry.deadline {
                return Ok(Some(entry.record.clone()));
            }
            drop(entry);
            // Lazy expiry on read.
            self.records.remove_if(key, |_, e| now >= e.deadline);
        }
        Ok(None)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .records
            .get(key)
            .map(|e| now < e.deadline)
            .unwrap_or(false))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .records
            .remove(key)
            .map(|(_, e)| now < e.deadline)
            .unwrap_or(false))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, StoredRecord>> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(record) = self.get(key).await? {
                out.insert(key.clone(), record);
            }
        }
        Ok(out)
    }

    async fn cleanup(&self, batch_max: usize) -> Result<u64> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|e| now >= e.deadline)
            .take(batch_max)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.records.remove_if(&key, |_, e| now >= e.deadline).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let now = Instant::now();
        let live = self.records.iter().filter(|e| now < e.deadline).count() as u64;
        let total = self.records.len() as u64;
        Ok(StorageStats {
            backend: "memory".to_string(),
            live: Some(live),
            expired: Some(total - live),
        })
    }
}

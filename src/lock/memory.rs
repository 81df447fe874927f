//! In-process lock backend.

use super::{KeyLock, LockToken};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Holder {
    token: LockToken,
    deadline: Instant,
}

/// DashMap-backed locks for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryKeyLock {
    holders: DashMap<String, Holder>,
}

impl MemoryKeyLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyLock for MemoryKeyLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        // The entry API holds the shard lock, making check-then-take atomic.
        match self.holders.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now < occupied.get().deadline {
                    return Ok(None);
                }
                let token = LockToken::fresh();
                occupied.insert(Holder {
                    token: token.clone(),
                    deadline: now + ttl,
                });
                Ok(Some(token))
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let token = LockToken::fresh();
                vacant.insert(Holder {
                    token: token.clone(),
                    deadline: now + ttl,
                });
                Ok(Some(token))
            }
        }
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        Ok(self
            .holders
            .remove_if(key, |_, holder| holder.token == *token)
            .is_some())
    }

    async fn is_locked(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .holders
            .get(key)
            .map(|h| now < h.deadline)
            .unwrap_or(false))
    }
}

//! Oversell guard: an atomic decrement-if-sufficient on named stock counters.
//!
//! The counter is never observed negative: a decrement that would cross zero
//! is refused as [`Reservation::Insufficient`]. The compensating operation is
//! [`StockCounter::release`], which the interceptor runs when the downstream
//! response is not 2xx.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;

/// Outcome of a reservation attempt, modeled as a value rather than an
/// exception so callers must handle every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// The quantity was reserved; `remaining` units are left.
    Reserved { remaining: i64 },
    /// The counter holds fewer units than requested; nothing was changed.
    Insufficient,
    /// No counter exists for the resource; nothing was changed.
    Unknown,
}

/// The stock counter contract.
#[async_trait]
pub trait StockCounter: Send + Sync + 'static {
    /// Atomically decrements the counter by `quantity` iff it holds at least
    /// that much.
    async fn reserve(&self, resource: &str, quantity: u64) -> Result<Reservation>;

    /// Compensating increment, releasing a prior reservation.
    async fn release(&self, resource: &str, quantity: u64) -> Result<()>;

    /// Current stock level, if the counter exists.
    async fn stock(&self, resource: &str) -> Result<Option<i64>>;

    /// Creates or resets a counter.
    async fn set_stock(&self, resource: &str, quantity: i64) -> Result<()>;
}

/// In-process counters for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStockCounter {
    counters: DashMap<String, i64>,
}

impl MemoryStockCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockCounter for MemoryStockCounter {
    async fn reserve(&self, resource: &str, quantity: u64) -> Result<Reservation> {
        let quantity = quantity as i64;
        // get_mut holds the shard lock for the read-check-write.
        match self.counters.get_mut(resource) {
            None => Ok(Reservation::Unknown),
            Some(mut stock) => {
                if *stock < quantity {
                    Ok(Reservation::Insufficient)
                } else {
                    *stock -= quantity;
                    Ok(Reservation::Reserved { remaining: *stock })
                }
            }
        }
    }

    async fn release(&self, resource: &str, quantity: u64) -> Result<()> {
        if let Some(mut stock) = self.counters.get_mut(resource) {
            *stock += quantity as i64;
        }
        Ok(())
    }

    async fn stock(&self, resource: &str) -> Result<Option<i64>> {
        Ok(self.counters.get(resource).map(|s| *s))
    }

    async fn set_stock(&self, resource: &str, quantity: i64) -> Result<()> {
        self.counters.insert(resource.to_string(), quantity);
        Ok(())
    }
}

/// Redis-backed counters under `product:stock:{id}`.
#[cfg(feature = "redis")]
pub struct RedisStockCounter {
    conn: redis::aio::ConnectionManager,
    reserve_script: redis::Script,
}

/// Decrement-if-sufficient.
///
/// Returns -1 for a missing counter and -2 for insufficient stock, so an
/// exact depletion (remaining 0) stays distinguishable from a refusal.
#[cfg(feature = "redis")]
const RESERVE_SCRIPT: &str = r"
local stock = redis.call('GET', KEYS[1])
if stock == false then
  return -1
end
stock = tonumber(stock)
local qty = tonumber(ARGV[1])
if stock < qty then
  return -2
end
redis.call('DECRBY', KEYS[1], qty)
return stock - qty
";

#[cfg(feature = "redis")]
impl RedisStockCounter {
    /// Connects to the server and prepares the reservation script.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self {
            conn,
            reserve_script: redis::Script::new(RESERVE_SCRIPT),
        })
    }

    fn counter_key(resource: &str) -> String {
        format!("product:stock:{resource}")
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl StockCounter for RedisStockCounter {
    async fn reserve(&self, resource: &str, quantity: u64) -> Result<Reservation> {
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .reserve_script
            .key(Self::counter_key(resource))
            .arg(quantity)
            .invoke_async(&mut conn)
            .await?;
        Ok(match outcome {
            -1 => Reservation::Unknown,
            -2 => Reservation::Insufficient,
            remaining => Reservation::Reserved { remaining },
        })
    }

    async fn release(&self, resource: &str, quantity: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("INCRBY")
            .arg(Self::counter_key(resource))
            .arg(quantity)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn stock(&self, resource: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let stock: Option<i64> = redis::cmd("GET")
            .arg(Self::counter_key(resource))
            .query_async(&mut conn)
            .await?;
        Ok(stock)
    }

    async fn set_stock(&self, resource: &str, quantity: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::counter_key(resource))
            .arg(quantity)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

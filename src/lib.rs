//! # axum-idem
//!
//! Request-level idempotency for axum services: attach a client-supplied
//! idempotency key to a mutating request and the server-visible side effect
//! happens **at most once** across retries, crashes, and concurrent
//! duplicates, with a byte-identical response returned to every replay
//! within a configured window. An optional oversell guard adds an atomic
//! stock-decrement primitive for inventory-constrained endpoints.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use axum::{Router, routing::post};
//! use axum_idem::{Config, IdempotencyLayer, Result};
//!
//! async fn create_order() -> &'static str {
//!     "created"
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_rust_env()?; // config/{RUST_ENV}.toml
//!     config.setup_tracing();
//!
//!     let layer = IdempotencyLayer::from_config(&config).await?;
//!     let app: Router = Router::new()
//!         .route("/orders", post(create_order))
//!         .layer(layer);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! With `config/dev.toml`:
//! ```toml
//! [idempotency]
//! mode = "strict"
//! ttl = "24h"
//!
//! [storage]
//! backend = "redis"
//! url = "{{ REDIS_URL }}"
//!
//! [lock]
//! backend = "redis"
//! url = "{{ REDIS_URL }}"
//! ```
//!
//! # What You Get
//!
//! | Feature | Description |
//! |---------|-------------|
//! | Replay cache | Two-level: in-process hot cache + durable backend |
//! | Exactly-once execution | Per-key distributed lock around the handler |
//! | Byte-identical replays | Status, body, and headers restored verbatim |
//! | Oversell guard | Atomic decrement-if-sufficient with compensation |
//! | Maintenance | Background + opportunistic eviction of expired records |
//! | Admin CLI | `idem-admin cleanup / generate-key / test-storage / stats` |
//!
//! # Cargo Features
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `redis` (default) | Redis storage, lock, stock counter, shared hot tier |
//! | `postgres` | PostgreSQL storage backend via sqlx |
//!
//! # Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Configuration loading and validation ([`Config`]) |
//! | [`layer`] | The interceptor ([`IdempotencyLayer`]) |
//! | [`key`] | Key validation, normalization, generation |
//! | [`filter`] | Sensitive-field masking/stripping ([`SensitiveFilter`]) |
//! | [`record`] | The stored replay payload ([`StoredRecord`]) |
//! | [`storage`] | Durable record backends (memory, redis, postgres) |
//! | [`lock`] | Per-key lock backends (memory, redis, file) |
//! | [`hot_cache`] | Positive-only recent-seen tiers |
//! | [`stock`] | Oversell guard counters |
//! | [`maintenance`] | Expired-record eviction |
//! | [`error`] | Error types ([`Error`], [`ErrorKind`]) |
//!
//! # Error Handling
//!
//! The library uses a custom [`Result`] type. Client-facing rejections use
//! fixed JSON shapes: `{"error": "Invalid idempotency key"}` (400),
//! `{"error": "Concurrent request detected", "retry_after": n}` (429),
//! `{"error": "Insufficient stock"}` / `{"error": "Product not found"}`
//! (409). Backend failures before the handler runs surface as 5xx so the
//! client can retry with the same key; failures after it are logged and
//! swallowed because the client already has its response.

mod config;
mod error;

pub mod filter;
pub mod hot_cache;
pub mod key;
pub mod layer;
pub mod lock;
pub mod maintenance;
pub mod record;
pub mod stock;
pub mod storage;

pub use config::*;
pub use error::*;
pub use filter::SensitiveFilter;
pub use hot_cache::{HotCache, SharedHotTier};
pub use layer::{IdempotencyLayer, IdempotencyService};
pub use lock::{FileKeyLock, KeyLock, LockToken, MemoryKeyLock};
pub use record::StoredRecord;
pub use stock::{MemoryStockCounter, Reservation, StockCounter};
pub use storage::{MemoryStorage, Storage, StorageStats};

#[cfg(feature = "redis")]
pub use hot_cache::RedisHotTier;
#[cfg(feature = "redis")]
pub use lock::RedisKeyLock;
#[cfg(feature = "redis")]
pub use stock::RedisStockCounter;
#[cfg(feature = "redis")]
pub use storage::RedisStorage;

#[cfg(feature = "postgres")]
pub use storage::PostgresStorage;

pub type Result<T> = std::result::Result<T, Error>;

//! The request-interception state machine, as a tower `Layer`/`Service` pair.
//!
//! Per request: extract and validate the key, consult the hot cache, take the
//! per-key lock with bounded retries, re-check storage under the lock, run
//! the oversell guard, let the handler execute, capture a successful
//! response, store it, warm the hot cache, release the lock. Losers of the
//! race either observe the winner's record or exhaust their lock retries and
//! receive 429.
//!
//! Backends are passed in by construction; the layer never discovers them
//! through any ambient registry.

use crate::{
    Config, Error, HotCache, IdempotencyConfig, Mode, Result, SensitiveFilter,
    lock::{self, KeyLock, LockToken},
    maintenance::Maintenance,
    record::{StoredRecord, capture_headers, is_host_controlled},
    stock::{Reservation, StockCounter},
    storage::{self, Storage},
};
use axum::{
    body::Body,
    extract::Request,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http::{HeaderName, HeaderValue, Method, StatusCode, header};
use serde_json::{Value, json};
use std::{
    sync::Arc,
    time::Duration,
};
use tower::{Layer, Service};

/// Response header marking a replayed response.
pub const IDEMPOTENT_RESPONSE_HEADER: &str = "x-idempotent-response";
/// Response header echoing the key a replay was served for.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";
/// Response header carrying the original response's capture time.
pub const CREATED_AT_HEADER: &str = "x-created-at";

/// Everything the per-request state machine needs, shared by all clones of
/// the service.
struct LayerContext {
    config: IdempotencyConfig,
    storage: Arc<dyn Storage>,
    lock: Arc<dyn KeyLock>,
    hot: HotCache,
    stock: Option<Arc<dyn StockCounter>>,
    filter: SensitiveFilter,
    maintenance: Arc<Maintenance>,
}

/// Layer that applies request-level idempotency.
///
/// # Example
///
/// ```rust,no_run
/// use axum::{Router, routing::post};
/// use axum_idem::{IdempotencyConfig, IdempotencyLayer, MemoryKeyLock, MemoryStorage};
/// use std::sync::Arc;
///
/// async fn create_order() -> &'static str {
///     "created"
/// }
///
/// let layer = IdempotencyLayer::new(
///     IdempotencyConfig::default(),
///     Arc::new(MemoryStorage::default()),
///     Arc::new(MemoryKeyLock::new()),
/// );
/// let app: Router = Router::new()
///     .route("/orders", post(create_order))
///     .layer(layer);
/// ```
#[derive(Clone)]
pub struct IdempotencyLayer {
    ctx: Arc<LayerContext>,
}

impl IdempotencyLayer {
    /// Creates a layer over the given backends.
    pub fn new(
        config: IdempotencyConfig,
        storage: Arc<dyn Storage>,
        lock: Arc<dyn KeyLock>,
    ) -> Self {
        let hot = HotCache::new(&config.fast_cache);
        let maintenance = Arc::new(Maintenance::new(config.cleanup_interval, config.cleanup_batch));
        Self {
            ctx: Arc::new(LayerContext {
                config,
                storage,
                lock,
                hot,
                stock: None,
                filter: SensitiveFilter::new(),
                maintenance,
            }),
        }
    }

    /// Builds a layer, its backends, and (when configured) its stock counter
    /// and shared hot-cache tier from a [`Config`].
    ///
    /// Misconfiguration fails here, at startup, never per request.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let storage = storage::from_config(&config.storage).await?;
        let lock = lock::from_config(&config.lock).await?;

        let mut layer = Self::new(config.idempotency.clone(), storage, lock);

        #[cfg(feature = "redis")]
        if let Some(url) = redis_url(config) {
            if config.idempotency.fast_cache.enabled {
                let tier = crate::hot_cache::RedisHotTier::connect(url, "idemp").await?;
                layer = layer.with_shared_hot_tier(Arc::new(tier));
            }
            if config.idempotency.oversell_protection {
                let counter = crate::stock::RedisStockCounter::connect(url).await?;
                layer = layer.with_stock_counter(Arc::new(counter));
            }
        }
        if config.idempotency.oversell_protection && layer.ctx.stock.is_none() {
            layer = layer.with_stock_counter(Arc::new(crate::stock::MemoryStockCounter::new()));
        }

        Ok(layer)
    }

    /// Attaches the stock counter used by the oversell guard.
    pub fn with_stock_counter(self, stock: Arc<dyn StockCounter>) -> Self {
        self.map_ctx(|ctx| ctx.stock = Some(stock))
    }

    /// Attaches a shared hot-cache tier.
    pub fn with_shared_hot_tier(self, tier: Arc<dyn crate::hot_cache::SharedHotTier>) -> Self {
        self.map_ctx(|ctx| {
            let fresh = HotCache::new(&ctx.config.fast_cache);
            ctx.hot = std::mem::replace(&mut ctx.hot, fresh).with_shared_tier(tier);
        })
    }

    /// Replaces the sensitive-data filter applied before payload logging.
    pub fn with_filter(self, filter: SensitiveFilter) -> Self {
        self.map_ctx(|ctx| ctx.filter = filter)
    }

    /// The storage backend this layer writes to, for wiring maintenance
    /// tasks or admin endpoints.
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.ctx.storage.clone()
    }

    /// The lock backend this layer coordinates through.
    pub fn lock(&self) -> Arc<dyn KeyLock> {
        self.ctx.lock.clone()
    }

    /// The stock counter, when the oversell guard is wired.
    pub fn stock_counter(&self) -> Option<Arc<dyn StockCounter>> {
        self.ctx.stock.clone()
    }

    /// The interceptor configuration.
    pub fn config(&self) -> &IdempotencyConfig {
        &self.ctx.config
    }

    fn map_ctx(mut self, f: impl FnOnce(&mut LayerContext)) -> Self {
        // Builder calls happen before the layer is shared; fall back to a
        // deep rebuild only if someone cloned it first.
        match Arc::get_mut(&mut self.ctx) {
            Some(ctx) => {
                f(ctx);
                self
            }
            None => {
                let mut ctx = LayerContext {
                    config: self.ctx.config.clone(),
                    storage: self.ctx.storage.clone(),
                    lock: self.ctx.lock.clone(),
                    hot: HotCache::new(&self.ctx.config.fast_cache),
                    stock: self.ctx.stock.clone(),
                    filter: self.ctx.filter.clone(),
                    maintenance: self.ctx.maintenance.clone(),
                };
                f(&mut ctx);
                Self { ctx: Arc::new(ctx) }
            }
        }
    }
}

#[cfg(feature = "redis")]
fn redis_url(config: &Config) -> Option<&str> {
    if let crate::StorageConfig::Redis { url, .. } = &config.storage {
        return Some(url);
    }
    if let crate::LockConfig::Redis { url, .. } = &config.lock {
        return Some(url);
    }
    None
}

impl<S> Layer<S> for IdempotencyLayer {
    type Service = IdempotencyService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdempotencyService {
            inner,
            ctx: self.ctx.clone(),
        }
    }
}

/// Service that runs the per-request idempotency state machine.
#[derive(Clone)]
pub struct IdempotencyService<S> {
    inner: S,
    ctx: Arc<LayerContext>,
}

impl<S> Service<Request> for IdempotencyService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let ctx = self.ctx.clone();
        let inner = self.inner.clone();
        Box::pin(intercept(ctx, inner, req))
    }
}

/// The per-request state machine.
async fn intercept<S>(
    ctx: Arc<LayerContext>,
    mut inner: S,
    req: Request,
) -> std::result::Result<Response, S::Error>
where
    S: Service<Request, Response = Response> + Send,
    S::Future: Send,
    S::Error: Send,
{
    // Reads never mutate, so they never carry side effects to guard.
    if !is_mutating(req.method()) {
        return inner.call(req).await;
    }

    // EXTRACT_KEY: header first, then (for POSTs) the JSON body field.
    let header_key = req
        .headers()
        .get(ctx.config.header_name.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let wants_body = (header_key.is_none() && req.method() == Method::POST)
        || (ctx.config.oversell_protection && ctx.stock.is_some());
    let (req, body_json) = if wants_body {
        match buffer_json_body(req).await {
            Ok(pair) => pair,
            Err(response) => return Ok(response),
        }
    } else {
        (req, None)
    };

    if let Some(body) = &body_json {
        tracing::debug!(payload = %ctx.filter.strip_for_log(body), "buffered request payload");
    }

    let raw_key = header_key.or_else(|| {
        body_json
            .as_ref()
            .and_then(|body| body.get(ctx.config.body_field.as_str()))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    });

    let Some(raw_key) = raw_key else {
        return match ctx.config.mode {
            Mode::Strict => {
                tracing::warn!("request is missing its idempotency key in strict mode");
                Ok(invalid_key_response())
            }
            Mode::Optional | Mode::Lax => inner.call(req).await,
        };
    };

    // VALIDATE on the normalized form; the normalized key is the identity
    // used everywhere downstream.
    let key = crate::key::normalize(&raw_key);
    if let Err(err) = crate::key::validate(&key) {
        tracing::warn!(error = %err, "rejecting invalid idempotency key");
        return Ok(invalid_key_response());
    }

    // HOT_CHECK: positive-only. A hit skips the lock and reads storage; a
    // miss (or an expired record behind a hit) falls through to the lock.
    if ctx.hot.seen(&key).await {
        match ctx.storage.get(&key).await {
            Ok(Some(record)) => {
                tracing::debug!(key = %key, "replay served via hot cache");
                return Ok(replay_response(&key, &record));
            }
            Ok(None) => {}
            Err(err) => return Ok(err.into_response()),
        }
    }

    // ACQUIRE_LOCK with bounded retries.
    let mut token: Option<LockToken> = None;
    for attempt in 1..=ctx.config.max_lock_attempts {
        match ctx.lock.acquire(&key, ctx.config.lock_ttl).await {
            Ok(Some(t)) => {
                token = Some(t);
                break;
            }
            Ok(None) if attempt < ctx.config.max_lock_attempts => {
                tokio::time::sleep(ctx.config.lock_retry_delay).await;
            }
            Ok(None) => {}
            Err(err) => return Ok(err.into_response()),
        }
    }
    let Some(token) = token else {
        tracing::info!(key = %key, "lock retries exhausted, rejecting concurrent duplicate");
        return Ok(concurrent_response(ctx.config.lock_ttl));
    };

    // STORAGE_GET under the lock: the loser of a race lands here and sees
    // the winner's committed record.
    match ctx.storage.get(&key).await {
        Ok(Some(record)) => {
            ctx.hot.warm(&key).await;
            release_lock(&ctx, &key, &token).await;
            tracing::debug!(key = %key, "replay served from storage");
            let response = replay_response(&key, &record);
            ctx.maintenance.run_if_due(ctx.storage.clone());
            return Ok(response);
        }
        Ok(None) => {}
        Err(err) => {
            release_lock(&ctx, &key, &token).await;
            return Ok(err.into_response());
        }
    }

    // OVERSELL_GUARD, when enabled and the payload names a resource.
    let mut reservation: Option<(String, u64)> = None;
    if ctx.config.oversell_protection
        && let Some(stock) = &ctx.stock
        && let Some(body) = &body_json
        && let Some((product_id, quantity)) = stock_request(body)
    {
        match stock.reserve(&product_id, quantity).await {
            Ok(Reservation::Reserved { remaining }) => {
                tracing::debug!(product_id = %product_id, quantity, remaining, "stock reserved");
                reservation = Some((product_id, quantity));
            }
            Ok(Reservation::Insufficient) => {
                tracing::info!(product_id = %product_id, quantity, "refusing oversell");
                release_lock(&ctx, &key, &token).await;
                return Ok(oversell_response("Insufficient stock"));
            }
            Ok(Reservation::Unknown) => {
                tracing::info!(product_id = %product_id, "stock counter missing for resource");
                release_lock(&ctx, &key, &token).await;
                return Ok(oversell_response("Product not found"));
            }
            Err(err) => {
                release_lock(&ctx, &key, &token).await;
                return Ok(err.into_response());
            }
        }
    }

    // HANDLER_EXECUTE. The lock is released on every exit path below; a
    // panicking handler is recovered by the lock's TTL.
    let response = match inner.call(req).await {
        Ok(response) => response,
        Err(err) => {
            if let Some((product_id, quantity)) = &reservation
                && let Some(stock) = &ctx.stock
            {
                if let Err(release_err) = stock.release(product_id, *quantity).await {
                    tracing::error!(product_id = %product_id, error = %release_err, "stock compensation failed");
                }
            }
            release_lock(&ctx, &key, &token).await;
            return Err(err);
        }
    };

    // Compensate the reservation when the business operation did not succeed.
    let status = response.status();
    if let Some((product_id, quantity)) = &reservation
        && let Some(stock) = &ctx.stock
        && !status.is_success()
    {
        match stock.release(product_id, *quantity).await {
            Ok(()) => tracing::debug!(product_id = %product_id, quantity, status = %status, "stock reservation released"),
            Err(err) => tracing::error!(product_id = %product_id, error = %err, "stock compensation failed"),
        }
    }

    // CAPTURE + STORE: only [200, 399] responses are replayable; a failed
    // business operation must stay retryable under the same key. Lax mode
    // checks but never stores.
    let response = if ctx.config.mode != Mode::Lax && status.as_u16() >= 200 && status.as_u16() < 400
    {
        let (parts, body) = response.into_parts();
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                let record = StoredRecord::new(
                    status.as_u16(),
                    bytes.clone(),
                    capture_headers(&parts.headers),
                    ctx.config.ttl.as_secs().max(1),
                );
                // Post-execution failures are logged and swallowed: the
                // client gets its response either way, and a later duplicate
                // simply re-executes.
                match ctx.storage.put(&key, &record, ctx.config.ttl).await {
                    Ok(true) => {
                        ctx.hot.warm(&key).await;
                    }
                    Ok(false) => {
                        tracing::debug!(key = %key, "record already present, keeping the first write");
                        ctx.hot.warm(&key).await;
                    }
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "storing replay record failed, response served without one");
                    }
                }
                Response::from_parts(parts, Body::from(bytes))
            }
            Err(err) => {
                tracing::error!(key = %key, error = %err, "response body could not be buffered for capture");
                release_lock(&ctx, &key, &token).await;
                return Ok(Error::internal("response capture failed").into_response());
            }
        }
    } else {
        response
    };

    release_lock(&ctx, &key, &token).await;
    ctx.maintenance.run_if_due(ctx.storage.clone());
    Ok(response)
}

/// Idempotency only guards requests that can carry side effects.
fn is_mutating(method: &Method) -> bool {
    !matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Buffers the request body and parses it as JSON, handing back a rebuilt
/// request whose body is replayed unchanged downstream. A non-JSON body is
/// simply `None`; a body that cannot be read at all is a client error.
async fn buffer_json_body(req: Request) -> std::result::Result<(Request, Option<Value>), Response> {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "request body could not be read");
            return Err(json_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "Request body could not be read"}),
            ));
        }
    };
    let parsed = serde_json::from_slice::<Value>(&bytes).ok();
    Ok((Request::from_parts(parts, Body::from(bytes)), parsed))
}

/// Pulls `product_id` and `quantity` out of a JSON payload. The id may be a
/// string or a number; a missing or zero quantity disables the guard for
/// this request.
fn stock_request(body: &Value) -> Option<(String, u64)> {
    let product_id = match body.get("product_id")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let quantity = body.get("quantity")?.as_u64().filter(|q| *q > 0)?;
    Some((product_id, quantity))
}

async fn release_lock(ctx: &LayerContext, key: &str, token: &LockToken) {
    match ctx.lock.release(key, token).await {
        Ok(true) => {}
        Ok(false) => tracing::debug!(key, "lock was already expired at release"),
        Err(err) => tracing::warn!(key, error = %err, "lock release failed"),
    }
}

/// Rebuilds the captured response: status and body verbatim, stored headers
/// minus host-controlled ones, plus the replay markers.
fn replay_response(key: &str, record: &StoredRecord) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(Bytes::clone(&record.body)));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &record.headers {
        if is_host_controlled(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }
    headers.insert(
        HeaderName::from_static(IDEMPOTENT_RESPONSE_HEADER),
        HeaderValue::from_static("true"),
    );
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&record.created_at.to_string()) {
        headers.insert(HeaderName::from_static(CREATED_AT_HEADER), value);
    }
    response
}

fn json_response(status: StatusCode, body: Value) -> Response {
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn invalid_key_response() -> Response {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({"error": "Invalid idempotency key"}),
    )
}

fn concurrent_response(lock_ttl: Duration) -> Response {
    let retry_after = lock_ttl.as_secs().max(1);
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": "Concurrent request detected", "retry_after": retry_after}),
    );
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn oversell_response(message: &str) -> Response {
    json_response(StatusCode::CONFLICT, json!({"error": message}))
}

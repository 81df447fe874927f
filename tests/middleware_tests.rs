//! End-to-end tests for the idempotency layer over the in-process backends.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::post,
};
use axum_idem::{
    IdempotencyConfig, IdempotencyLayer, KeyLock, MemoryKeyLock, MemoryStorage,
    MemoryStockCounter, Mode, StockCounter, Storage, StoredRecord,
    layer::{IDEMPOTENCY_KEY_HEADER, IDEMPOTENT_RESPONSE_HEADER},
};
use bytes::Bytes;
use serde_json::{Value, json};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tower::ServiceExt;

/// Application state counting handler executions.
#[derive(Clone)]
struct AppState {
    counter: Arc<AtomicU32>,
    fail: bool,
}

impl AppState {
    fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(0)),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(0)),
            fail: true,
        }
    }

    fn executions(&self) -> u32 {
        self.counter.load(Ordering::SeqCst)
    }
}

/// Handler whose body embeds the execution count, so a replay of the first
/// execution is distinguishable from a second execution.
async fn order_handler(State(state): State<AppState>) -> impl IntoResponse {
    let n = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    if state.fail {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "boom"})),
        )
            .into_response()
    } else {
        (
            StatusCode::CREATED,
            Json(json!({"order_id": 42, "execution": n})),
        )
            .into_response()
    }
}

struct Harness {
    app: Router,
    state: AppState,
    storage: Arc<MemoryStorage>,
    lock: Arc<MemoryKeyLock>,
    stock: Arc<MemoryStockCounter>,
}

fn harness(config: IdempotencyConfig, state: AppState) -> Harness {
    let storage = Arc::new(MemoryStorage::default());
    let lock = Arc::new(MemoryKeyLock::new());
    let stock = Arc::new(MemoryStockCounter::new());

    let layer = IdempotencyLayer::new(
        config,
        storage.clone() as Arc<dyn Storage>,
        lock.clone() as Arc<dyn axum_idem::KeyLock>,
    )
    .with_stock_counter(stock.clone() as Arc<dyn StockCounter>);

    let app = Router::new()
        .route("/orders", post(order_handler).get(order_handler))
        .layer(layer)
        .with_state(state.clone());

    Harness {
        app,
        state,
        storage,
        lock,
        stock,
    }
}

fn fast_config() -> IdempotencyConfig {
    IdempotencyConfig::default()
        .with_lock_retry_delay(Duration::from_millis(10))
        .with_max_lock_attempts(3)
}

fn post_request(key: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/orders")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("X-Idempotency-Key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_first_write_then_replay() {
    let h = harness(fast_config(), AppState::new());

    let response1 = h
        .app
        .clone()
        .oneshot(post_request(
            Some("k1"),
            json!({"product_id": 7, "quantity": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response1.status(), StatusCode::CREATED);
    assert!(response1.headers().get(IDEMPOTENT_RESPONSE_HEADER).is_none());
    let body1 = body_json(response1).await;
    assert_eq!(body1, json!({"order_id": 42, "execution": 1}));

    let response2 = h
        .app
        .clone()
        .oneshot(post_request(
            Some("k1"),
            json!({"product_id": 7, "quantity": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response2.status(), StatusCode::CREATED);
    assert_eq!(
        response2.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(response2.headers().get(IDEMPOTENCY_KEY_HEADER).unwrap(), "k1");
    let body2 = body_json(response2).await;
    assert_eq!(body2, json!({"order_id": 42, "execution": 1}));

    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_different_keys_execute_independently() {
    let h = harness(fast_config(), AppState::new());

    for key in ["key-a", "key-b", "key-c"] {
        let response = h
            .app
            .clone()
            .oneshot(post_request(Some(key), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(h.state.executions(), 3);
}

#[tokio::test]
async fn test_concurrent_duplicates_execute_once() {
    let h = harness(fast_config(), AppState::new());

    let req1 = post_request(Some("k2"), json!({}));
    let req2 = post_request(Some("k2"), json!({}));

    let (response1, response2) = tokio::join!(
        h.app.clone().oneshot(req1),
        h.app.clone().oneshot(req2)
    );

    // The handler ran exactly once no matter how the race resolved.
    assert_eq!(h.state.executions(), 1);

    for response in [response1.unwrap(), response2.unwrap()] {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = body_json(response).await;
            assert_eq!(body["error"], "Concurrent request detected");
        } else {
            assert_eq!(status, StatusCode::CREATED);
            let body = body_json(response).await;
            assert_eq!(body, json!({"order_id": 42, "execution": 1}));
        }
    }
}

#[tokio::test]
async fn test_strict_mode_rejects_missing_key() {
    let h = harness(fast_config(), AppState::new());

    let response = h
        .app
        .clone()
        .oneshot(post_request(None, json!({"name": "no key here"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body, json!({"error": "Invalid idempotency key"}));
    assert_eq!(h.state.executions(), 0);
}

#[tokio::test]
async fn test_invalid_keys_rejected() {
    let h = harness(fast_config(), AppState::new());

    let too_long = "x".repeat(256);
    for bad in [
        "has space",
        "has/slash",
        too_long.as_str(),
        "zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz",
    ] {
        let response = h
            .app
            .clone()
            .oneshot(post_request(Some(bad), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "key {bad:?}");
    }
    assert_eq!(h.state.executions(), 0);
}

#[tokio::test]
async fn test_uuid_keys_normalize_to_one_identity() {
    let h = harness(fast_config(), AppState::new());
    let upper = "550E8400-E29B-41D4-A716-446655440000";
    let lower = "550e8400-e29b-41d4-a716-446655440000";

    let response1 = h
        .app
        .clone()
        .oneshot(post_request(Some(upper), json!({})))
        .await
        .unwrap();
    assert_eq!(response1.status(), StatusCode::CREATED);

    let response2 = h
        .app
        .clone()
        .oneshot(post_request(Some(lower), json!({})))
        .await
        .unwrap();
    assert_eq!(
        response2.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(
        response2.headers().get(IDEMPOTENCY_KEY_HEADER).unwrap(),
        lower
    );
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_optional_mode_passes_through_missing_key() {
    let h = harness(fast_config().with_mode(Mode::Optional), AppState::new());

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request(None, json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(h.state.executions(), 2);
}

#[tokio::test]
async fn test_optional_mode_still_stores_keyed_requests() {
    let h = harness(fast_config().with_mode(Mode::Optional), AppState::new());

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request(Some("opt-1"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_lax_mode_checks_but_never_stores() {
    let h = harness(fast_config().with_mode(Mode::Lax), AppState::new());

    // Fresh executions are never captured...
    for _ in 0..2 {
        h.app
            .clone()
            .oneshot(post_request(Some("lax-1"), json!({})))
            .await
            .unwrap();
    }
    assert_eq!(h.state.executions(), 2);
    assert!(h.storage.get("lax-1").await.unwrap().is_none());

    // ...but an existing record is still replayed.
    let seeded = StoredRecord::new(
        200,
        Bytes::from_static(b"{\"seeded\":true}"),
        vec![("content-type".into(), "application/json".into())],
        60,
    );
    h.storage
        .put("lax-2", &seeded, Duration::from_secs(60))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(post_request(Some("lax-2"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"seeded": true}));
    assert_eq!(h.state.executions(), 2);
}

#[tokio::test]
async fn test_body_field_fallback_for_post() {
    let h = harness(fast_config(), AppState::new());

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request(
                None,
                json!({"idempotency_key": "k-body-1", "product_id": 7}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_oversell_refusal_leaves_stock_untouched() {
    let h = harness(
        fast_config().with_oversell_protection(true),
        AppState::new(),
    );
    h.stock.set_stock("9", 2).await.unwrap();

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request(
                Some("k3"),
                json!({"product_id": 9, "quantity": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(response).await,
            json!({"error": "Insufficient stock"})
        );
    }
    assert_eq!(h.stock.stock("9").await.unwrap(), Some(2));
    assert_eq!(h.state.executions(), 0);
}

#[tokio::test]
async fn test_oversell_unknown_product() {
    let h = harness(
        fast_config().with_oversell_protection(true),
        AppState::new(),
    );

    let response = h
        .app
        .clone()
        .oneshot(post_request(
            Some("k-unknown"),
            json!({"product_id": "ghost", "quantity": 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await, json!({"error": "Product not found"}));
    assert_eq!(h.state.executions(), 0);
}

#[tokio::test]
async fn test_oversell_compensation_on_failed_handler() {
    let h = harness(
        fast_config().with_oversell_protection(true),
        AppState::failing(),
    );
    h.stock.set_stock("5", 5).await.unwrap();

    let response = h
        .app
        .clone()
        .oneshot(post_request(
            Some("k4"),
            json!({"product_id": 5, "quantity": 2}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    // The reservation was rolled back and nothing was stored.
    assert_eq!(h.stock.stock("5").await.unwrap(), Some(5));
    assert!(h.storage.get("k4").await.unwrap().is_none());
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_oversell_success_keeps_reservation() {
    let h = harness(
        fast_config().with_oversell_protection(true),
        AppState::new(),
    );
    h.stock.set_stock("7", 5).await.unwrap();

    let request = || post_request(Some("k-ok"), json!({"product_id": 7, "quantity": 2}));

    let response = h.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(h.stock.stock("7").await.unwrap(), Some(3));

    // A replay is served from storage and must not decrement again.
    let response = h.app.clone().oneshot(request()).await.unwrap();
    assert_eq!(
        response.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(h.stock.stock("7").await.unwrap(), Some(3));
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_ttl_expiry_isolates_operations() {
    let h = harness(
        fast_config().with_ttl(Duration::from_millis(100)),
        AppState::new(),
    );

    let response = h
        .app
        .clone()
        .oneshot(post_request(Some("k5"), json!({"variant": "first"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    tokio::time::sleep(Duration::from_millis(250)).await;

    // After the window the same key is a fresh operation, body differences
    // and all.
    let response = h
        .app
        .clone()
        .oneshot(post_request(Some("k5"), json!({"variant": "second"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(
        body_json(response).await,
        json!({"order_id": 42, "execution": 2})
    );
    assert_eq!(h.state.executions(), 2);
}

#[tokio::test]
async fn test_error_responses_are_not_stored() {
    let h = harness(fast_config(), AppState::failing());

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(post_request(Some("k-err"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    // A failed business operation stays retryable under the same key.
    assert_eq!(h.state.executions(), 2);
    assert!(h.storage.get("k-err").await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_requests_bypass_idempotency() {
    let h = harness(fast_config(), AppState::new());

    for _ in 0..2 {
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/orders")
                    .header("X-Idempotency-Key", "k-get")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }
    assert_eq!(h.state.executions(), 2);
}

#[tokio::test]
async fn test_held_lock_yields_429_with_retry_after() {
    let h = harness(
        fast_config()
            .with_max_lock_attempts(1)
            .with_lock_retry_delay(Duration::from_millis(1)),
        AppState::new(),
    );

    // Simulate another in-flight request holding the key.
    let _token = h
        .lock
        .acquire("k-held", Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(post_request(Some("k-held"), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(http::header::RETRY_AFTER).unwrap(),
        "30"
    );
    let body = body_json(response).await;
    assert_eq!(body["error"], "Concurrent request detected");
    assert_eq!(body["retry_after"], 30);
    assert_eq!(h.state.executions(), 0);
}

#[tokio::test]
async fn test_loser_observes_record_after_winner_releases() {
    let h = harness(fast_config(), AppState::new());

    // Winner path executed to completion first.
    h.app
        .clone()
        .oneshot(post_request(Some("k-race"), json!({})))
        .await
        .unwrap();

    // A "loser" arriving later sees the committed record even while a lock
    // is not held anymore.
    let response = h
        .app
        .clone()
        .oneshot(post_request(Some("k-race"), json!({})))
        .await
        .unwrap();
    assert_eq!(
        response.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(h.state.executions(), 1);
}

#[tokio::test]
async fn test_replay_preserves_captured_content_type() {
    let h = harness(fast_config(), AppState::new());

    h.app
        .clone()
        .oneshot(post_request(Some("k-hdr"), json!({})))
        .await
        .unwrap();

    let replay = h
        .app
        .clone()
        .oneshot(post_request(Some("k-hdr"), json!({})))
        .await
        .unwrap();
    assert_eq!(
        replay
            .headers()
            .get(http::header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap(),
        "application/json"
    );
}

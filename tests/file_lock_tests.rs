//! The idempotency layer over file-system locks, as used by co-located
//! processes sharing a lock directory.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::IntoResponse,
    routing::post,
};
use axum_idem::{
    FileKeyLock, FileLockStyle, IdempotencyConfig, IdempotencyLayer, KeyLock, MemoryStorage,
    Storage, layer::IDEMPOTENT_RESPONSE_HEADER,
};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tempfile::TempDir;
use tower::ServiceExt;

#[derive(Clone)]
struct AppState {
    counter: Arc<AtomicU32>,
}

async fn handler(State(state): State<AppState>) -> impl IntoResponse {
    let n = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::CREATED, Json(json!({"execution": n})))
}

fn app(storage: Arc<MemoryStorage>, lock: Arc<FileKeyLock>, state: AppState) -> Router {
    let config = IdempotencyConfig::default()
        .with_lock_retry_delay(Duration::from_millis(5))
        .with_max_lock_attempts(2);
    let layer = IdempotencyLayer::new(
        config,
        storage as Arc<dyn Storage>,
        lock as Arc<dyn KeyLock>,
    );
    Router::new()
        .route("/op", post(handler))
        .layer(layer)
        .with_state(state)
}

fn request(key: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/op")
        .header("content-type", "application/json")
        .header("X-Idempotency-Key", key)
        .body(Body::from("{}"))
        .unwrap()
}

fn file_lock(dir: &TempDir, style: FileLockStyle) -> Arc<FileKeyLock> {
    Arc::new(
        FileKeyLock::new(
            dir.path(),
            style,
            Duration::from_millis(1),
            Duration::from_millis(100),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_replay_over_flock_style() {
    let dir = TempDir::new().unwrap();
    let state = AppState {
        counter: Arc::new(AtomicU32::new(0)),
    };
    let app = app(
        Arc::new(MemoryStorage::default()),
        file_lock(&dir, FileLockStyle::Flock),
        state.clone(),
    );

    let first = app.clone().oneshot(request("k1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let replay = app.clone().oneshot(request("k1")).await.unwrap();
    assert_eq!(replay.status(), StatusCode::CREATED);
    assert_eq!(
        replay.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_replay_over_rename_style() {
    let dir = TempDir::new().unwrap();
    let state = AppState {
        counter: Arc::new(AtomicU32::new(0)),
    };
    let app = app(
        Arc::new(MemoryStorage::default()),
        file_lock(&dir, FileLockStyle::Rename),
        state.clone(),
    );

    let first = app.clone().oneshot(request("k1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let replay = app.clone().oneshot(request("k1")).await.unwrap();
    assert_eq!(
        replay.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_two_instances_share_storage_and_lock_dir() {
    // Two layer instances with separate lock-backend objects over the same
    // directory and the same durable store, like two worker processes.
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::default());
    let state = AppState {
        counter: Arc::new(AtomicU32::new(0)),
    };

    let app_a = app(
        storage.clone(),
        file_lock(&dir, FileLockStyle::Rename),
        state.clone(),
    );
    let app_b = app(
        storage.clone(),
        file_lock(&dir, FileLockStyle::Rename),
        state.clone(),
    );

    let first = app_a.oneshot(request("shared-key")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    // The second "process" observes the first one's record.
    let replay = app_b.oneshot(request("shared-key")).await.unwrap();
    assert_eq!(
        replay.headers().get(IDEMPOTENT_RESPONSE_HEADER).unwrap(),
        "true"
    );
    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_contention_across_instances_resolves_to_one_execution() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(MemoryStorage::default());
    let state = AppState {
        counter: Arc::new(AtomicU32::new(0)),
    };

    let app_a = app(
        storage.clone(),
        file_lock(&dir, FileLockStyle::Flock),
        state.clone(),
    );
    let app_b = app(
        storage.clone(),
        file_lock(&dir, FileLockStyle::Flock),
        state.clone(),
    );

    let (ra, rb) = tokio::join!(
        app_a.oneshot(request("contested")),
        app_b.oneshot(request("contested"))
    );

    assert_eq!(state.counter.load(Ordering::SeqCst), 1);
    for response in [ra.unwrap(), rb.unwrap()] {
        assert!(
            response.status() == StatusCode::CREATED
                || response.status() == StatusCode::TOO_MANY_REQUESTS
        );
    }
}

//! Dispatcher wake-and-retry against a mock upstream: a command that
//! first fails with "vehicle asleep" succeeds after exactly one wake and
//! one retry.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use fleetgate::api::FleetClient;
use fleetgate::bridge::CommandDispatcher;
use fleetgate::cache::ResponseCache;

#[derive(Clone)]
struct Upstream {
    commands: Arc<AtomicU32>,
    wakes: Arc<AtomicU32>,
    asleep_on_first: Arc<AtomicBool>,
}

async fn command_handler(
    State(upstream): State<Upstream>,
    Path((_vin, name)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> impl IntoResponse {
    let attempt = upstream.commands.fetch_add(1, Ordering::SeqCst) + 1;

    // Signing-required commands must carry the signature block; the
    // broadcast-domain alerts go unsigned.
    if name == "door_lock" || name == "set_sentry_mode" {
        let signed = body
            .as_ref()
            .map(|Json(b)| b.get("signature").is_some())
            .unwrap_or(false);
        assert!(signed, "{name} must be signed");
    }

    if attempt == 1 && upstream.asleep_on_first.load(Ordering::SeqCst) {
        (StatusCode::REQUEST_TIMEOUT, "vehicle unavailable").into_response()
    } else {
        Json(json!({"response": {"result": true, "reason": ""}})).into_response()
    }
}

async fn wake_handler(State(upstream): State<Upstream>) -> impl IntoResponse {
    upstream.wakes.fetch_add(1, Ordering::SeqCst);
    Json(json!({"response": {"state": "online"}}))
}

async fn spawn_upstream(asleep_on_first: bool) -> (String, Upstream) {
    let upstream = Upstream {
        commands: Arc::new(AtomicU32::new(0)),
        wakes: Arc::new(AtomicU32::new(0)),
        asleep_on_first: Arc::new(AtomicBool::new(asleep_on_first)),
    };
    let app = Router::new()
        .route("/api/1/vehicles/:vin/command/:name", post(command_handler))
        .route("/api/1/vehicles/:vin/wake_up", post(wake_handler))
        .with_state(upstream.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), upstream)
}

#[tokio::test]
async fn asleep_command_wakes_once_and_retries_once() {
    let (base_url, upstream) = spawn_upstream(true).await;
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = ResponseCache::open(cache_dir.path(), 300, true).unwrap();

    // Seed the cache to verify write-success invalidation.
    cache.put("5YJ3WAKE", json!({"stale": true}), None).unwrap();

    let dispatcher = Arc::new(CommandDispatcher::new(
        "5YJ3WAKE",
        FleetClient::new(base_url, "test-token"),
        cache.clone(),
        None,
        b"session-key",
    ));

    let result = dispatcher
        .dispatch("door.lock", &json!({}))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result["result"], true);
    assert_eq!(upstream.wakes.load(Ordering::SeqCst), 1, "exactly one wake");
    assert_eq!(
        upstream.commands.load(Ordering::SeqCst),
        2,
        "exactly two command POSTs"
    );
    // Success invalidated the cached snapshot.
    assert!(cache.get("5YJ3WAKE").is_none());
}

#[tokio::test]
async fn awake_command_needs_no_wake() {
    let (base_url, upstream) = spawn_upstream(false).await;
    let dispatcher = Arc::new(CommandDispatcher::new(
        "5YJ3OK",
        FleetClient::new(base_url, "test-token"),
        ResponseCache::disabled(),
        None,
        b"session-key",
    ));

    let result = dispatcher
        .dispatch("sentry.on", &json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["result"], true);
    assert_eq!(upstream.wakes.load(Ordering::SeqCst), 0);
    assert_eq!(upstream.commands.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unsigned_broadcast_command_passes_through() {
    let (base_url, upstream) = spawn_upstream(false).await;
    let dispatcher = Arc::new(CommandDispatcher::new(
        "5YJ3HONK",
        FleetClient::new(base_url, "test-token"),
        ResponseCache::disabled(),
        None,
        b"session-key",
    ));

    let result = dispatcher
        .dispatch("honk_horn", &json!({}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["result"], true);
    assert_eq!(upstream.commands.load(Ordering::SeqCst), 1);
}

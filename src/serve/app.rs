//! The combined application: tool surface (HTTP) and telemetry receiver
//! (WebSocket) on one port, so a single public tunnel covers both.
//!
//! Dispatch order:
//!
//! 1. WebSocket at `/` → telemetry receiver (decode, fan out; malformed
//!    frames are logged and dropped).
//! 2. `GET|HEAD /.well-known/appspecific/com.fleet.3p.public-key.pem` →
//!    the EC public key the provider uses to verify signed configs.
//! 3. Any other `HEAD` → fast 200 (the provider's domain verification).
//! 4. Everything else → the tool router, with the request path passed
//!    through untouched. The tool routes are merged at the root — never
//!    nested under a prefix — because path rewriting would break the
//!    tool surface's own routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use crate::mcp::server::{tool_router, ToolState};
use crate::telemetry::decoder::TelemetryDecoder;
use crate::telemetry::fanout::FrameFanout;

/// Fixed path at which the provider fetches the public key.
pub const WELL_KNOWN_KEY_PATH: &str = "/.well-known/appspecific/com.fleet.3p.public-key.pem";

/// State for the telemetry receiver routes.
#[derive(Clone)]
pub struct ReceiverState {
    pub fanout: Arc<FrameFanout>,
    pub decoder: TelemetryDecoder,
    pub public_key_pem: Option<String>,
    pub connection_count: Arc<AtomicU64>,
}

impl ReceiverState {
    pub fn new(fanout: Arc<FrameFanout>, public_key_pem: Option<String>) -> Self {
        Self {
            fanout,
            decoder: TelemetryDecoder::new(),
            public_key_pem,
            connection_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Build the combined router.
pub fn combined_app(receiver: ReceiverState, tool_state: Option<ToolState>) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route(WELL_KNOWN_KEY_PATH, get(well_known_key))
        .with_state(receiver);

    if let Some(tool_state) = tool_state {
        router = router.merge(tool_router(tool_state));
    }

    // HEAD-anything responds 200 before routing; the provider probes
    // arbitrary paths during domain verification.
    router
        .layer(axum::middleware::from_fn(head_shortcut))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn head_shortcut(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    if request.method() == Method::HEAD && request.uri().path() != WELL_KNOWN_KEY_PATH {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

/// `/` is both the vehicle's WebSocket entry point and a trivial index.
async fn root_handler(
    State(state): State<ReceiverState>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    match ws {
        Some(upgrade) => upgrade
            .on_upgrade(move |socket| handle_vehicle_socket(socket, state))
            .into_response(),
        None => "fleetgate".into_response(),
    }
}

async fn well_known_key(State(state): State<ReceiverState>) -> Response {
    match &state.public_key_pem {
        Some(pem) => (
            StatusCode::OK,
            [("content-type", "application/x-pem-file")],
            pem.clone(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Receive binary telemetry frames from one vehicle connection.
///
/// Malformed frames are logged with their byte count and dropped — the
/// receiver never dies because of bad input. Disconnect ends the loop.
async fn handle_vehicle_socket(mut socket: WebSocket, state: ReceiverState) {
    let connections = state.connection_count.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(connections, "vehicle connected");

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                tracing::debug!(%error, "telemetry socket error");
                break;
            }
        };
        match message {
            Message::Binary(data) => {
                match state.decoder.decode(&data) {
                    Ok(frame) => state.fanout.on_frame(&frame).await,
                    Err(error) => {
                        tracing::warn!(bytes = data.len(), %error, "failed to decode telemetry frame");
                    }
                }
            }
            Message::Text(text) => {
                // The vehicle sends binary; text is unexpected but harmless.
                tracing::debug!(preview = %text.chars().take(120).collect::<String>(), "unexpected text frame");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    let remaining = state.connection_count.fetch_sub(1, Ordering::Relaxed) - 1;
    tracing::info!(remaining, "vehicle disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn receiver() -> ReceiverState {
        ReceiverState::new(
            Arc::new(FrameFanout::new()),
            Some("-----BEGIN PUBLIC KEY-----\nABC\n-----END PUBLIC KEY-----\n".to_string()),
        )
    }

    #[tokio::test]
    async fn test_head_any_path_is_200() {
        let app = combined_app(receiver(), None);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("HEAD")
                    .uri("/anything/at/all")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_well_known_serves_pem() {
        let app = combined_app(receiver(), None);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(WELL_KNOWN_KEY_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("BEGIN PUBLIC KEY"));
    }

    #[tokio::test]
    async fn test_well_known_404_without_key() {
        let state = ReceiverState::new(Arc::new(FrameFanout::new()), None);
        let app = combined_app(state, None);
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(WELL_KNOWN_KEY_PATH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_plain_get_root_is_index() {
        let app = combined_app(receiver(), None);
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

//! Combined runtime over a real port: WebSocket telemetry, provider
//! probes, the OAuth flow, and authenticated tool calls all on the same
//! listener.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use serde_json::{json, Value};

use fleetgate::mcp::server::{ToolServer, ToolState, TransportSecurity};
use fleetgate::mcp::OAuthAuthServer;
use fleetgate::serve::app::{combined_app, ReceiverState, WELL_KNOWN_KEY_PATH};
use fleetgate::telemetry::fanout::{FrameFanout, FrameSink};
use fleetgate::telemetry::TelemetryFrame;

const TEST_PEM: &str = "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZI\n-----END PUBLIC KEY-----\n";

struct Recorder {
    frames: Mutex<Vec<TelemetryFrame>>,
}

#[async_trait]
impl FrameSink for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

struct Harness {
    base_url: String,
    ws_url: String,
    recorder: Arc<Recorder>,
    config_dir: tempfile::TempDir,
}

async fn spawn_runtime() -> Harness {
    let config_dir = tempfile::tempdir().unwrap();

    let recorder = Arc::new(Recorder {
        frames: Mutex::new(vec![]),
    });
    let mut fanout = FrameFanout::new();
    fanout.add_sink(recorder.clone());

    let mut env = HashMap::new();
    env.insert(
        "FLEETGATE_CONFIG_DIR".to_string(),
        config_dir.path().to_string_lossy().to_string(),
    );
    env.insert("FLEETGATE_VIN".to_string(), "5YJ3SERVE".to_string());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let tool_state = ToolState {
        server: Arc::new(ToolServer::new(env)),
        oauth: Arc::new(OAuthAuthServer::new(
            Some("test-client".to_string()),
            Some("test-secret".to_string()),
        )),
        security: Arc::new(TransportSecurity::new(None)),
        issuer: base_url.clone(),
    };
    let receiver = ReceiverState::new(Arc::new(fanout), Some(TEST_PEM.to_string()));
    let app = combined_app(receiver, Some(tool_state));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Harness {
        ws_url: format!("ws://{addr}/"),
        base_url,
        recorder,
        config_dir,
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

/// Run the authorization-code flow and return a bearer token.
async fn obtain_token(client: &reqwest::Client, base_url: &str) -> String {
    let verifier = fleetgate::api::auth::generate_code_verifier();
    let challenge = fleetgate::api::auth::code_challenge_s256(&verifier);

    let authorize = client
        .get(format!("{base_url}/authorize"))
        .query(&[
            ("response_type", "code"),
            ("client_id", "agent-under-test"),
            ("redirect_uri", "http://localhost:19999/callback"),
            ("scope", "tools"),
            ("state", "s1"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .unwrap();
    assert!(authorize.status().is_redirection());

    let location = authorize.headers()["location"].to_str().unwrap();
    let redirect = url::Url::parse(location).unwrap();
    let code = redirect
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .unwrap();

    let token_response: Value = client
        .post(format!("{base_url}/token"))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("code_verifier", verifier.as_str()),
            ("client_id", "agent-under-test"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    token_response["access_token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn combined_port_serves_ws_head_wellknown_and_tools() {
    let harness = spawn_runtime().await;
    let client = http_client();

    // Provider probes: HEAD anything is a fast 200.
    let head = client
        .head(format!("{}/anything/at/all", harness.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), 200);

    // Well-known public key.
    let key = client
        .get(format!("{}{}", harness.base_url, WELL_KNOWN_KEY_PATH))
        .send()
        .await
        .unwrap();
    assert_eq!(key.status(), 200);
    assert!(key.text().await.unwrap().contains("BEGIN PUBLIC KEY"));

    // Vehicle WebSocket on the same port.
    let (mut ws, _) = tokio_tungstenite::connect_async(harness.ws_url.as_str())
        .await
        .unwrap();
    let frame = common::payload("5YJ3SERVE", &[(8, common::int_value(55))]);
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(frame))
        .await
        .unwrap();

    // A malformed frame is dropped without killing the receiver.
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(vec![
        0x0A, 0xFF, 0xFF,
    ]))
    .await
    .unwrap();

    let good = common::payload("5YJ3SERVE", &[(8, common::int_value(54))]);
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(good))
        .await
        .unwrap();

    // Wait for both good frames to land in the sink.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if harness.recorder.frames.lock().unwrap().len() >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "frames never reached the sink"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    {
        let frames = harness.recorder.frames.lock().unwrap();
        assert_eq!(frames[0].vin, "5YJ3SERVE");
        assert_eq!(frames[0].data[0].field_name, "Soc");
    }

    // Unauthenticated tool calls are rejected.
    let unauthorized = client
        .post(format!("{}/mcp", harness.base_url))
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);
    assert!(unauthorized.headers().contains_key("www-authenticate"));

    // Full OAuth flow, then an authenticated tool call.
    let token = obtain_token(&client, &harness.base_url).await;

    let listed: Value = client
        .post(format!("{}/mcp", harness.base_url))
        .bearer_auth(&token)
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = listed["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "vehicle_info"));

    // cache_status re-enters the CLI dispatcher and answers hermetically.
    let called: Value = client
        .post(format!("{}/mcp", harness.base_url))
        .bearer_auth(&token)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/call",
            "params": {"name": "cache_status", "arguments": {}},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(called["result"]["isError"], false);
    let text = called["result"]["content"][0]["text"].as_str().unwrap();
    let envelope: Value = serde_json::from_str(text).unwrap();
    assert_eq!(envelope["ok"], true);
    assert_eq!(envelope["command"], "cache status");
    assert_eq!(envelope["data"]["enabled"], true);

    drop(harness.config_dir);
}

#[tokio::test]
async fn discovery_documents_are_published() {
    let harness = spawn_runtime().await;
    let client = http_client();

    let discovery: Value = client
        .get(format!(
            "{}/.well-known/oauth-authorization-server",
            harness.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(discovery["issuer"], harness.base_url);
    assert_eq!(discovery["code_challenge_methods_supported"][0], "S256");

    let resource: Value = client
        .get(format!(
            "{}/.well-known/oauth-protected-resource",
            harness.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        resource["resource"],
        format!("{}/mcp", harness.base_url)
    );
}

#[tokio::test]
async fn revoked_token_stops_working() {
    let harness = spawn_runtime().await;
    let client = http_client();
    let token = obtain_token(&client, &harness.base_url).await;

    let ok = client
        .post(format!("{}/mcp", harness.base_url))
        .bearer_auth(&token)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);

    client
        .post(format!("{}/revoke", harness.base_url))
        .form(&[("token", token.as_str())])
        .send()
        .await
        .unwrap();

    let rejected = client
        .post(format!("{}/mcp", harness.base_url))
        .bearer_auth(&token)
        .json(&json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), 401);
}

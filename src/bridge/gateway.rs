//! WebSocket client for the operator gateway.
//!
//! Protocol, in operator role:
//!
//! 1. Receive a `connect.challenge` event carrying a nonce.
//! 2. Send `{method: "connect", params: {role: "operator", …, nonce}}`.
//! 3. Require a `hello-ok` event; anything else aborts the connection.
//! 4. Emit events as JSON text frames.
//!
//! Reconnection uses exponential backoff (1s base, ×2, capped at 60s)
//! with ±10% jitter. `send_event` is best-effort: not connected drops the
//! event, a send failure marks the client disconnected and never raises.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::error::GatewayError;

const BACKOFF_BASE_SECS: f64 = 1.0;
const BACKOFF_FACTOR: f64 = 2.0;
const BACKOFF_MAX_SECS: f64 = 60.0;

/// Per-message deadline during the handshake.
const HANDSHAKE_TIMEOUT_SECS: u64 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state: closed → connecting → handshaking → open → closed.
/// Any failure transitions back to closed.
pub struct GatewayClient {
    url: String,
    token: Option<String>,
    client_id: String,
    client_version: String,
    ws: Option<WsStream>,
    connected: bool,
    send_count: u64,
}

impl GatewayClient {
    pub fn new(url: impl Into<String>, token: Option<String>, client_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token,
            client_id: client_id.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            ws: None,
            connected: false,
            send_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Events successfully handed to the transport.
    pub fn send_count(&self) -> u64 {
        self.send_count
    }

    /// Connect and complete the challenge handshake.
    pub async fn connect(&mut self) -> Result<(), GatewayError> {
        self.connected = false;

        let (ws, _response) = connect_async(self.url.as_str()).await.map_err(|source| {
            GatewayError::Connect {
                url: self.url.clone(),
                source,
            }
        })?;
        self.ws = Some(ws);

        match self.handshake().await {
            Ok(()) => {
                self.connected = true;
                tracing::info!(url = %self.url, "connected to gateway");
                Ok(())
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn recv_json(&mut self) -> Result<Value, GatewayError> {
        let ws = self.ws.as_mut().ok_or(GatewayError::Closed)?;
        let deadline = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);

        loop {
            let frame = tokio::time::timeout(deadline, ws.next())
                .await
                .map_err(|_| GatewayError::Timeout(HANDSHAKE_TIMEOUT_SECS))?;
            match frame {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|_| GatewayError::UnexpectedFrame {
                        expected: "JSON text frame",
                        got: text.chars().take(120).collect(),
                    });
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(GatewayError::Closed),
                Some(Ok(other)) => {
                    return Err(GatewayError::UnexpectedFrame {
                        expected: "JSON text frame",
                        got: format!("{other:?}").chars().take(120).collect(),
                    });
                }
                Some(Err(_)) => return Err(GatewayError::Closed),
            }
        }
    }

    /// Challenge → connect → hello-ok.
    async fn handshake(&mut self) -> Result<(), GatewayError> {
        let challenge = self.recv_json().await?;
        if challenge.get("event").and_then(Value::as_str) != Some("connect.challenge") {
            return Err(GatewayError::UnexpectedFrame {
                expected: "connect.challenge",
                got: challenge
                    .get("event")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
            });
        }
        let nonce = challenge
            .pointer("/data/nonce")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut params = json!({
            "role": "operator",
            "scopes": ["operator.send"],
            "client_id": self.client_id,
            "client_version": self.client_version,
            "nonce": nonce,
        });
        if let Some(token) = &self.token {
            params["token"] = json!(token);
        }
        let connect_msg = json!({"method": "connect", "params": params});

        let ws = self.ws.as_mut().ok_or(GatewayError::Closed)?;
        ws.send(Message::Text(connect_msg.to_string()))
            .await
            .map_err(|_| GatewayError::Closed)?;

        let reply = self.recv_json().await?;
        if reply.get("event").and_then(Value::as_str) != Some("hello-ok") {
            let detail = reply
                .get("error")
                .or_else(|| reply.get("event"))
                .map(Value::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            return Err(GatewayError::Rejected(detail));
        }
        Ok(())
    }

    /// Send an event, best-effort.
    ///
    /// Drops silently when not connected; on transport failure marks the
    /// client disconnected and returns `Ok` — the frame loop must never
    /// die on a send.
    pub async fn send_event(&mut self, event: &Value) -> bool {
        if !self.connected {
            return false;
        }
        let Some(ws) = self.ws.as_mut() else {
            return false;
        };
        match ws.send(Message::Text(event.to_string())).await {
            Ok(()) => {
                self.send_count += 1;
                true
            }
            Err(error) => {
                tracing::warn!(%error, "gateway send failed; marking disconnected");
                self.connected = false;
                false
            }
        }
    }

    /// Close the connection gracefully, tolerating failures.
    pub async fn close(&mut self) {
        self.connected = false;
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
        }
    }

    /// Connect with exponential backoff. `max_attempts == 0` retries
    /// forever.
    pub async fn connect_with_backoff(&mut self, max_attempts: u32) -> Result<(), GatewayError> {
        let mut attempt = 0u32;
        let mut backoff = BACKOFF_BASE_SECS;

        loop {
            attempt += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    if max_attempts > 0 && attempt >= max_attempts {
                        return Err(error);
                    }
                    let jitter = rand::thread_rng().gen_range(-0.1..=0.1) * backoff;
                    let wait = (backoff + jitter).clamp(0.0, BACKOFF_MAX_SECS);
                    tracing::info!(
                        attempt,
                        %error,
                        wait_secs = format!("{wait:.1}"),
                        "gateway connection failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    backoff = (backoff * BACKOFF_FACTOR).min(BACKOFF_MAX_SECS);
                }
            }
        }
    }
}

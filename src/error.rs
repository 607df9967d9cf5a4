//! Error taxonomy for the gateway.
//!
//! Each kind maps to a handling policy: transient errors are retried or
//! absorbed by the frame loop, "vehicle asleep" gets a single wake + retry,
//! provider-verification timing gets bounded retries, and configuration
//! errors surface to the user with guidance.

use thiserror::Error;

/// Errors from the upstream Fleet API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP 408 on a vehicle endpoint — the vehicle must be woken first.
    #[error("vehicle is asleep")]
    VehicleAsleep,

    /// HTTP 429 — the provider rate-limited us.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// HTTP 412 from the partner registration endpoint — the tunnel
    /// hostname is not an allowed origin on the provider side.
    #[error("origin not allowed by provider: {0}")]
    OriginNotAllowed(String),

    /// HTTP 424 from the partner registration endpoint — the provider
    /// could not fetch the public key (tunnel propagation delay).
    #[error("provider could not fetch public key: {0}")]
    KeyNotFetchable(String),

    /// The OAuth token lacks scopes required for the requested operation.
    #[error("token is missing required scopes: {0}")]
    MissingScopes(String),

    /// Authentication failure against the provider.
    #[error("authentication failed (HTTP {status}): {message}")]
    Auth { status: u16, message: String },

    /// Any other non-success status.
    #[error("provider returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Transport-level failure (DNS, TLS, connect, body read).
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body was not the JSON shape we expected.
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status associated with this error, when one exists.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::VehicleAsleep => Some(408),
            Self::RateLimited { .. } => Some(429),
            Self::OriginNotAllowed(_) => Some(412),
            Self::KeyNotFetchable(_) => Some(424),
            Self::Auth { status, .. } | Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Stable machine-readable code for the JSON error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::VehicleAsleep => "vehicle_asleep",
            Self::RateLimited { .. } => "rate_limited",
            Self::OriginNotAllowed(_) => "origin_not_allowed",
            Self::KeyNotFetchable(_) => "key_not_fetchable",
            Self::MissingScopes(_) => "missing_scopes",
            Self::Auth { .. } => "auth_failed",
            Self::Status { .. } => "api_error",
            Self::Transport(_) => "network_error",
            Self::Decode(_) => "decode_error",
        }
    }
}

/// Local configuration problems (missing credentials, bad field names, …).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure to decode a binary telemetry frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated varint at offset {0}")]
    TruncatedVarint(usize),

    #[error("truncated field (wire type {wire_type}) at offset {offset}")]
    TruncatedField { wire_type: u8, offset: usize },

    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u8),
}

/// Gateway (outbound bridge) connection failures.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to gateway at {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("handshake failed: expected {expected}, got {got}")]
    UnexpectedFrame { expected: &'static str, got: String },

    #[error("handshake rejected by gateway: {0}")]
    Rejected(String),

    #[error("handshake timed out after {0}s")]
    Timeout(u64),

    #[error("gateway closed the connection during handshake")]
    Closed,
}

/// Tunnel lifecycle failures (provisioning, registration, remote config).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TunnelError(pub String);

impl TunnelError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Trigger registration / validation failures.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("maximum of {0} triggers reached; delete some before creating new ones")]
    LimitReached(usize),

    #[error("invalid trigger condition: {0}")]
    InvalidCondition(String),
}

/// Usage errors from the serve command (bad flag combinations, busy ports).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct UsageError(pub String);

impl UsageError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

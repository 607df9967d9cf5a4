//! Bearer-authenticated HTTP client for the Fleet API.
//!
//! Maps provider status codes onto the error taxonomy (408 asleep,
//! 412 origin, 424 key-fetch, 429 rate limit) and retries rate-limited
//! requests using the `retry-after` header.

use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use crate::error::ApiError;

/// Attempts per request when the provider rate-limits us.
const RATE_LIMIT_RETRIES: u32 = 3;

/// Cap on a single `retry-after` wait.
const RATE_LIMIT_MAX_WAIT_SECS: u64 = 60;

/// Thin Fleet API transport.
#[derive(Clone)]
pub struct FleetClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl FleetClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    /// Swap the bearer token (after a refresh).
    pub fn update_token(&mut self, access_token: impl Into<String>) {
        self.access_token = access_token.into();
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get(&self, path: &str) -> Result<Value, ApiError> {
        self.get_with_query(path, &[]).await
    }

    pub async fn get_with_query(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Value, ApiError> {
        self.request(reqwest::Method::GET, path, query, None).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>) -> Result<Value, ApiError> {
        self.request(reqwest::Method::POST, path, &[], body).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ApiError> {
        self.request(reqwest::Method::DELETE, path, &[], None).await
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut req = self
                .http
                .request(method.clone(), &url)
                .bearer_auth(&self.access_token);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(body) = &body {
                req = req.json(body);
            }

            let response = req.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < RATE_LIMIT_RETRIES {
                let wait = retry_after_secs(&response).min(RATE_LIMIT_MAX_WAIT_SECS);
                tracing::warn!(%url, wait_secs = wait, attempt, "rate limited; backing off");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            return map_response(status, response).await;
        }
    }
}

fn retry_after_secs(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(5)
}

async fn map_response(status: StatusCode, response: reqwest::Response) -> Result<Value, ApiError> {
    if status.is_success() {
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        return Ok(value);
    }

    let body = response.text().await.unwrap_or_default();
    let message = body.chars().take(500).collect::<String>();

    Err(match status.as_u16() {
        408 => ApiError::VehicleAsleep,
        412 => ApiError::OriginNotAllowed(message),
        424 => ApiError::KeyNotFetchable(message),
        429 => ApiError::RateLimited {
            retry_after_secs: 0,
        },
        401 => ApiError::Auth {
            status: 401,
            message,
        },
        403 if message.to_lowercase().contains("scope") => ApiError::MissingScopes(message),
        403 => ApiError::Auth {
            status: 403,
            message,
        },
        other => ApiError::Status {
            status: other,
            message,
        },
    })
}

//! Provider-side OAuth helpers: PKCE material, token exchange/refresh,
//! partner-account registration, and the JWS used to sign telemetry
//! configurations.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::protocol::signer::compute_config_signature;

/// Token response from the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Generate a high-entropy PKCE code verifier (base64url, no padding).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 code challenge for `verifier`.
pub fn code_challenge_s256(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Build the provider authorization URL for the interactive login flow.
pub fn build_auth_url(
    authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[&str],
    code_challenge: &str,
    state: &str,
) -> String {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &scopes.join(" "))
        .append_pair("state", state)
        .append_pair("code_challenge", code_challenge)
        .append_pair("code_challenge_method", "S256")
        .finish();
    format!("{authorize_url}?{query}")
}

async fn token_request(token_url: &str, form: &[(&str, &str)]) -> Result<TokenData, ApiError> {
    let response = reqwest::Client::new()
        .post(token_url)
        .form(form)
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Auth {
            status: status.as_u16(),
            message,
        });
    }
    response
        .json::<TokenData>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Exchange an authorization code for tokens.
pub async fn exchange_code(
    token_url: &str,
    code: &str,
    code_verifier: &str,
    client_id: &str,
    client_secret: Option<&str>,
    redirect_uri: &str,
) -> Result<TokenData, ApiError> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("code_verifier", code_verifier),
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }
    token_request(token_url, &form).await
}

/// Refresh the access token.
pub async fn refresh_access_token(
    token_url: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: Option<&str>,
) -> Result<TokenData, ApiError> {
    let mut form = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", client_id),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret));
    }
    token_request(token_url, &form).await
}

/// Obtain a partner token via the client-credentials grant.
pub async fn get_partner_token(
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    audience: &str,
) -> Result<String, ApiError> {
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", client_id),
        ("client_secret", client_secret),
        ("scope", "openid vehicle_device_data vehicle_cmds vehicle_charging_cmds"),
        ("audience", audience),
    ];
    let data = token_request(token_url, &form).await?;
    Ok(data.access_token)
}

/// Register (or re-register) the partner domain with the provider.
///
/// A 422 "already been taken" response is an idempotent duplicate and is
/// treated as success.
pub async fn register_partner_account(
    api_base: &str,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    domain: &str,
) -> Result<(), ApiError> {
    let partner_token = get_partner_token(token_url, client_id, client_secret, api_base).await?;

    let response = reqwest::Client::new()
        .post(format!("{api_base}/api/1/partner_accounts"))
        .bearer_auth(partner_token)
        .json(&json!({"domain": domain}))
        .send()
        .await?;
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let message = response.text().await.unwrap_or_default();
    if status.as_u16() == 422 && message.contains("already been taken") {
        tracing::debug!(domain, "partner domain already registered");
        return Ok(());
    }

    Err(match status.as_u16() {
        412 => ApiError::OriginNotAllowed(message),
        424 => ApiError::KeyNotFetchable(message),
        other => ApiError::Auth {
            status: other,
            message,
        },
    })
}

/// Sign a telemetry configuration as a compact JWS.
///
/// Header + payload are base64url segments; the signature is the
/// HMAC-SHA256 config signature over `header.payload` keyed by the
/// partner client secret.
pub fn sign_config_jws(client_secret: &str, config: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(config.to_string());
    let signing_input = format!("{header}.{payload}");
    let signature = compute_config_signature(client_secret.as_bytes(), signing_input.as_bytes());
    format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature))
}

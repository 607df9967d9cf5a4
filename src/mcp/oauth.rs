//! In-memory OAuth 2.1 authorization server.
//!
//! Implements the authorization-code-with-PKCE and refresh-token grants
//! for the personal tool server. Storage is entirely in memory; tokens
//! are opaque random strings.
//!
//! Unknown client ids are auto-created as permissive clients (any
//! redirect URI, any scope). This is intentional and safe only because
//! the surface is gated at the network layer — the tunnel ACL or a
//! loopback bind decides who can reach the server at all. Do not relax
//! the network gate while keeping this permissiveness.

use std::collections::HashMap;
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Authorization code lifetime.
const CODE_TTL_SECS: i64 = 300;

/// Access token lifetime.
const ACCESS_TTL_SECS: i64 = 3600;

/// A registered (or auto-created) OAuth client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    pub token_endpoint_auth_method: String,
    /// Permissive clients accept any redirect URI and scope set.
    pub permissive: bool,
}

#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
    pub redirect_uri: String,
    pub redirect_uri_provided_explicitly: bool,
    pub code_challenge: String,
    pub resource: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub expires_at: i64,
    pub resource: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
}

/// Parameters of an `/authorize` request after validation.
#[derive(Debug, Clone)]
pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub redirect_uri_provided_explicitly: bool,
    pub scopes: Vec<String>,
    pub state: Option<String>,
    pub code_challenge: String,
    pub resource: Option<String>,
}

/// OAuth errors surfaced as `{error, error_description}` bodies.
#[derive(Debug, thiserror::Error)]
#[error("{description}")]
pub struct OAuthFlowError {
    pub error: &'static str,
    pub description: String,
}

impl OAuthFlowError {
    fn new(error: &'static str, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
        }
    }

    pub fn body(&self) -> Value {
        json!({"error": self.error, "error_description": self.description})
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn now() -> i64 {
    Utc::now().timestamp()
}

#[derive(Default)]
struct Storage {
    clients: HashMap<String, ClientRecord>,
    codes: HashMap<String, AuthorizationCode>,
    access_tokens: HashMap<String, AccessToken>,
    refresh_tokens: HashMap<String, RefreshToken>,
}

/// The embedded authorization server.
pub struct OAuthAuthServer {
    configured_client_id: Option<String>,
    configured_client_secret: Option<String>,
    storage: Mutex<Storage>,
}

impl OAuthAuthServer {
    pub fn new(client_id: Option<String>, client_secret: Option<String>) -> Self {
        Self {
            configured_client_id: client_id,
            configured_client_secret: client_secret,
            storage: Mutex::new(Storage::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Storage> {
        match self.storage.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fetch a client, auto-creating a permissive record for unknown ids.
    /// The configured client id gets the configured secret attached so
    /// token-endpoint authentication succeeds.
    pub fn get_client(&self, client_id: &str) -> ClientRecord {
        let mut storage = self.lock();
        if let Some(client) = storage.clients.get(client_id) {
            return client.clone();
        }

        let secret = if Some(client_id) == self.configured_client_id.as_deref() {
            self.configured_client_secret.clone()
        } else {
            None
        };
        let record = ClientRecord {
            client_id: client_id.to_string(),
            token_endpoint_auth_method: if secret.is_some() {
                "client_secret_post".to_string()
            } else {
                "none".to_string()
            },
            client_secret: secret,
            redirect_uris: Vec::new(),
            permissive: true,
        };
        storage.clients.insert(client_id.to_string(), record.clone());
        record
    }

    /// Register an explicit (dynamically registered) client.
    pub fn register_client(&self, record: ClientRecord) {
        self.lock().clients.insert(record.client_id.clone(), record);
    }

    /// Handle an authorization request: mint a single-use code and return
    /// the redirect URL with `code` (and `state`) appended.
    pub fn authorize(&self, params: AuthorizeParams) -> Result<String, OAuthFlowError> {
        let client = self.get_client(&params.client_id);
        if !client.permissive
            && !params.redirect_uri.is_empty()
            && !client.redirect_uris.contains(&params.redirect_uri)
        {
            return Err(OAuthFlowError::new(
                "invalid_request",
                "redirect_uri is not registered for this client",
            ));
        }
        if params.code_challenge.is_empty() {
            return Err(OAuthFlowError::new(
                "invalid_request",
                "code_challenge is required (PKCE S256)",
            ));
        }

        let code = new_token();
        let record = AuthorizationCode {
            code: code.clone(),
            client_id: params.client_id.clone(),
            scopes: params.scopes.clone(),
            expires_at: now() + CODE_TTL_SECS,
            redirect_uri: params.redirect_uri.clone(),
            redirect_uri_provided_explicitly: params.redirect_uri_provided_explicitly,
            code_challenge: params.code_challenge.clone(),
            resource: params.resource.clone(),
        };
        self.lock().codes.insert(code.clone(), record);

        let separator = if params.redirect_uri.contains('?') { '&' } else { '?' };
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("code", &code);
        if let Some(state) = &params.state {
            query.append_pair("state", state);
        }
        Ok(format!("{}{separator}{}", params.redirect_uri, query.finish()))
    }

    /// Peek at a stored authorization code (absent once exchanged).
    pub fn load_authorization_code(&self, code: &str) -> Option<AuthorizationCode> {
        self.lock().codes.get(code).cloned()
    }

    /// Exchange an authorization code for tokens. Codes are single-use:
    /// the code is removed before any validation result is returned.
    pub fn exchange_authorization_code(
        &self,
        code: &str,
        client_id: &str,
        code_verifier: &str,
    ) -> Result<Value, OAuthFlowError> {
        let record = {
            let mut storage = self.lock();
            storage.codes.remove(code)
        };
        let Some(record) = record else {
            return Err(OAuthFlowError::new("invalid_grant", "unknown or used code"));
        };

        if record.client_id != client_id {
            return Err(OAuthFlowError::new("invalid_grant", "code issued to another client"));
        }
        if record.expires_at < now() {
            return Err(OAuthFlowError::new("invalid_grant", "authorization code expired"));
        }

        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
        if challenge != record.code_challenge {
            return Err(OAuthFlowError::new("invalid_grant", "PKCE verification failed"));
        }

        Ok(self.mint_tokens(client_id, record.scopes, record.resource))
    }

    /// Exchange a refresh token, rotating it. The original scopes are
    /// preserved unless a narrower set is requested.
    pub fn exchange_refresh_token(
        &self,
        refresh_token: &str,
        client_id: &str,
        requested_scopes: Option<Vec<String>>,
    ) -> Result<Value, OAuthFlowError> {
        let record = {
            let mut storage = self.lock();
            storage.refresh_tokens.remove(refresh_token)
        };
        let Some(record) = record else {
            return Err(OAuthFlowError::new("invalid_grant", "unknown refresh token"));
        };
        if record.client_id != client_id {
            return Err(OAuthFlowError::new(
                "invalid_grant",
                "refresh token issued to another client",
            ));
        }

        let scopes = match requested_scopes {
            Some(requested) if !requested.is_empty() => {
                let narrowed: Vec<String> = requested
                    .into_iter()
                    .filter(|s| record.scopes.contains(s))
                    .collect();
                if narrowed.is_empty() {
                    record.scopes
                } else {
                    narrowed
                }
            }
            _ => record.scopes,
        };

        Ok(self.mint_tokens(client_id, scopes, None))
    }

    fn mint_tokens(&self, client_id: &str, scopes: Vec<String>, resource: Option<String>) -> Value {
        let access = new_token();
        let refresh = new_token();

        let mut storage = self.lock();
        storage.access_tokens.insert(
            access.clone(),
            AccessToken {
                token: access.clone(),
                client_id: client_id.to_string(),
                scopes: scopes.clone(),
                expires_at: now() + ACCESS_TTL_SECS,
                resource,
            },
        );
        storage.refresh_tokens.insert(
            refresh.clone(),
            RefreshToken {
                token: refresh.clone(),
                client_id: client_id.to_string(),
                scopes: scopes.clone(),
            },
        );

        let mut response = json!({
            "access_token": access,
            "token_type": "Bearer",
            "expires_in": ACCESS_TTL_SECS,
            "refresh_token": refresh,
        });
        if !scopes.is_empty() {
            response["scope"] = json!(scopes.join(" "));
        }
        response
    }

    /// Validate a bearer token; `None` for unknown or expired tokens.
    pub fn load_access_token(&self, token: &str) -> Option<AccessToken> {
        let storage = self.lock();
        let record = storage.access_tokens.get(token)?;
        if record.expires_at < now() {
            return None;
        }
        Some(record.clone())
    }

    /// Revoke an access or refresh token. Unknown tokens are a no-op,
    /// as RFC 7009 requires.
    pub fn revoke_token(&self, token: &str) {
        let mut storage = self.lock();
        storage.access_tokens.remove(token);
        storage.refresh_tokens.remove(token);
    }

    /// Authorization-server discovery document.
    pub fn discovery_document(&self, issuer: &str) -> Value {
        json!({
            "issuer": issuer,
            "authorization_endpoint": format!("{issuer}/authorize"),
            "token_endpoint": format!("{issuer}/token"),
            "revocation_endpoint": format!("{issuer}/revoke"),
            "response_types_supported": ["code"],
            "grant_types_supported": ["authorization_code", "refresh_token"],
            "code_challenge_methods_supported": ["S256"],
            "token_endpoint_auth_methods_supported": ["client_secret_post", "none"],
        })
    }

    /// Protected-resource discovery document.
    pub fn resource_document(&self, issuer: &str) -> Value {
        json!({
            "resource": format!("{issuer}/mcp"),
            "authorization_servers": [issuer],
            "bearer_methods_supported": ["header"],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::{code_challenge_s256, generate_code_verifier};

    fn server() -> OAuthAuthServer {
        OAuthAuthServer::new(Some("configured-id".to_string()), Some("shh".to_string()))
    }

    fn authorize(server: &OAuthAuthServer, client_id: &str, challenge: &str) -> String {
        let redirect = server
            .authorize(AuthorizeParams {
                client_id: client_id.to_string(),
                redirect_uri: "http://localhost:7777/callback".to_string(),
                redirect_uri_provided_explicitly: true,
                scopes: vec!["tools".to_string()],
                state: Some("st8".to_string()),
                code_challenge: challenge.to_string(),
                resource: None,
            })
            .unwrap();
        // Extract ?code=... from the redirect.
        let url = url::Url::parse(&redirect).unwrap();
        url.query_pairs()
            .find(|(k, _)| k == "code")
            .map(|(_, v)| v.to_string())
            .unwrap()
    }

    #[test]
    fn test_unknown_client_auto_created_permissive() {
        let server = server();
        let client = server.get_client("never-seen");
        assert!(client.permissive);
        assert!(client.client_secret.is_none());

        let configured = server.get_client("configured-id");
        assert_eq!(configured.client_secret.as_deref(), Some("shh"));
    }

    #[test]
    fn test_full_code_exchange() {
        let server = server();
        let verifier = generate_code_verifier();
        let code = authorize(&server, "agent", &code_challenge_s256(&verifier));

        let tokens = server
            .exchange_authorization_code(&code, "agent", &verifier)
            .unwrap();
        assert_eq!(tokens["token_type"], "Bearer");
        assert_eq!(tokens["scope"], "tools");

        let access = tokens["access_token"].as_str().unwrap();
        let record = server.load_access_token(access).unwrap();
        assert_eq!(record.client_id, "agent");
    }

    #[test]
    fn test_code_is_single_use() {
        let server = server();
        let verifier = generate_code_verifier();
        let code = authorize(&server, "agent", &code_challenge_s256(&verifier));

        assert!(server.load_authorization_code(&code).is_some());
        server
            .exchange_authorization_code(&code, "agent", &verifier)
            .unwrap();
        assert!(server.load_authorization_code(&code).is_none());
        assert!(server
            .exchange_authorization_code(&code, "agent", &verifier)
            .is_err());
    }

    #[test]
    fn test_pkce_mismatch_rejected_and_code_consumed() {
        let server = server();
        let verifier = generate_code_verifier();
        let code = authorize(&server, "agent", &code_challenge_s256(&verifier));

        let result = server.exchange_authorization_code(&code, "agent", "wrong-verifier");
        assert!(result.is_err());
        // Single-use even on failure.
        assert!(server.load_authorization_code(&code).is_none());
    }

    #[test]
    fn test_refresh_rotation_preserves_scopes() {
        let server = server();
        let verifier = generate_code_verifier();
        let code = authorize(&server, "agent", &code_challenge_s256(&verifier));
        let tokens = server
            .exchange_authorization_code(&code, "agent", &verifier)
            .unwrap();

        let refresh = tokens["refresh_token"].as_str().unwrap();
        let rotated = server
            .exchange_refresh_token(refresh, "agent", None)
            .unwrap();
        assert_eq!(rotated["scope"], "tools");

        // The old refresh token is gone.
        assert!(server
            .exchange_refresh_token(refresh, "agent", None)
            .is_err());
    }

    #[test]
    fn test_revoke_access_token() {
        let server = server();
        let verifier = generate_code_verifier();
        let code = authorize(&server, "agent", &code_challenge_s256(&verifier));
        let tokens = server
            .exchange_authorization_code(&code, "agent", &verifier)
            .unwrap();

        let access = tokens["access_token"].as_str().unwrap();
        assert!(server.load_access_token(access).is_some());
        server.revoke_token(access);
        assert!(server.load_access_token(access).is_none());
        // Revoking again is a no-op.
        server.revoke_token(access);
    }

    #[test]
    fn test_redirect_carries_code_and_state() {
        let server = server();
        let redirect = server
            .authorize(AuthorizeParams {
                client_id: "agent".to_string(),
                redirect_uri: "http://localhost:7777/callback".to_string(),
                redirect_uri_provided_explicitly: true,
                scopes: vec![],
                state: Some("xyz".to_string()),
                code_challenge: "challenge".to_string(),
                resource: None,
            })
            .unwrap();
        assert!(redirect.starts_with("http://localhost:7777/callback?code="));
        assert!(redirect.contains("state=xyz"));
    }
}

//! Telemetry session lifecycle.
//!
//! Owns the sequence that makes the vehicle willing to push frames here:
//!
//! 1. The combined runtime has already bound the receiver port.
//! 2. Start the public tunnel; record hostname, CA, and URL.
//! 3. Reconcile the registered partner domain with the tunnel hostname
//!    (bounded retries while the provider cannot fetch the public key,
//!    interactive remediation when the origin is not allowed).
//! 4. Sign and push the fleet telemetry configuration.
//! 5. Yield a session handle; `shutdown` tears everything down in
//!    reverse order, tolerating failures at every step.

use std::time::Duration;

use crate::api::auth::{
    build_auth_url, code_challenge_s256, exchange_code, generate_code_verifier,
    register_partner_account, sign_config_jws,
};
use crate::api::vehicle::build_telemetry_config;
use crate::api::{FleetClient, VehicleApi};
use crate::config::{Settings, AUTHORIZE_URL, DEFAULT_SCOPES, TOKEN_URL};
use crate::error::{ApiError, TunnelError};
use crate::tunnel::{TunnelInfo, TunnelManager};

use super::fields::FieldConfig;

/// Attempts and spacing while the provider reports the public key as
/// not yet fetchable (tunnel propagation delay).
const REGISTER_MAX_RETRIES: u32 = 12;
const REGISTER_RETRY_SPACING: Duration = Duration::from_secs(5);

/// An active telemetry session.
pub struct TelemetrySession {
    pub tunnel_url: String,
    pub hostname: String,
    pub vin: String,
    pub port: u16,
    settings: Settings,
    client: FleetClient,
    tunnel: TunnelManager,
    config_created: bool,
    original_domain: Option<String>,
}

impl TelemetrySession {
    /// Run the full setup sequence.
    ///
    /// On error, everything already set up is rolled back before the
    /// error is returned.
    pub async fn start(
        settings: &Settings,
        vin: &str,
        port: u16,
        fields: &FieldConfig,
        interactive: bool,
    ) -> anyhow::Result<Self> {
        let access_token = settings
            .access_token
            .clone()
            .ok_or_else(|| TunnelError::new("no access token; set FLEETGATE_ACCESS_TOKEN"))?;
        let client = FleetClient::new(settings.api_base_url(), access_token);

        let tunnel = TunnelManager::new().with_cert_dir(settings.config_dir.join("serve"));
        tunnel.check_available().await?;
        tunnel.check_running().await?;

        let info = tunnel.start_funnel(port).await?;
        tracing::info!(url = %info.url, "tunnel active");

        let mut session = Self {
            tunnel_url: info.url.clone(),
            hostname: info.hostname.clone(),
            vin: vin.to_string(),
            port,
            settings: settings.clone(),
            client,
            tunnel,
            config_created: false,
            original_domain: None,
        };

        if let Err(e) = session.setup_remote(&info, fields, interactive).await {
            session.shutdown().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn setup_remote(
        &mut self,
        info: &TunnelInfo,
        fields: &FieldConfig,
        interactive: bool,
    ) -> anyhow::Result<()> {
        self.original_domain = self.reconcile_partner_domain(interactive).await?;
        self.push_fleet_config(info, fields, interactive).await?;
        self.config_created = true;
        Ok(())
    }

    /// Re-register the partner domain when the tunnel hostname differs
    /// from the registered one. Returns the original domain when it was
    /// changed, so teardown can restore it.
    async fn reconcile_partner_domain(
        &self,
        interactive: bool,
    ) -> anyhow::Result<Option<String>> {
        let registered = self
            .settings
            .domain
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('.')
            .to_lowercase();
        let tunnel_host = self.hostname.trim_end_matches('.').to_lowercase();
        if registered == tunnel_host {
            return Ok(None);
        }

        let (client_id, client_secret) = self.partner_credentials()?;
        tracing::info!(hostname = %self.hostname, "re-registering partner domain");

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match register_partner_account(
                self.client.base_url(),
                TOKEN_URL,
                &client_id,
                &client_secret,
                &self.hostname,
            )
            .await
            {
                Ok(()) => break,
                Err(ApiError::KeyNotFetchable(_)) if attempt < REGISTER_MAX_RETRIES => {
                    tracing::info!(
                        attempt,
                        max = REGISTER_MAX_RETRIES,
                        "waiting for tunnel to become reachable by the provider"
                    );
                    tokio::time::sleep(REGISTER_RETRY_SPACING).await;
                }
                Err(ApiError::OriginNotAllowed(_)) if interactive => {
                    eprintln!();
                    eprintln!("The provider requires the tunnel domain as an allowed origin:");
                    eprintln!("  1. Open your developer portal application settings");
                    eprintln!("  2. Add this as an allowed origin URL: https://{}", self.hostname);
                    eprintln!("  3. Save, then press Enter to retry (Ctrl+C to cancel)");
                    wait_for_enter().await;
                }
                Err(ApiError::OriginNotAllowed(_)) => {
                    return Err(TunnelError::new(format!(
                        "add https://{} as an allowed origin URL in the developer portal, then retry",
                        self.hostname
                    ))
                    .into());
                }
                Err(ApiError::KeyNotFetchable(_)) => {
                    return Err(TunnelError::new(format!(
                        "the provider could not fetch the public key from https://{}; \
                         verify the tunnel is reachable and retry",
                        self.hostname
                    ))
                    .into());
                }
                Err(e) => {
                    return Err(TunnelError::new(format!(
                        "partner re-registration failed for {}: {e}",
                        self.hostname
                    ))
                    .into());
                }
            }
        }

        Ok(self.settings.domain.clone())
    }

    /// Sign and push the fleet telemetry configuration; on missing
    /// scopes, interactively re-authorize with the full scope set and
    /// retry once.
    async fn push_fleet_config(
        &mut self,
        info: &TunnelInfo,
        fields: &FieldConfig,
        interactive: bool,
    ) -> anyhow::Result<()> {
        let (_, client_secret) = self.partner_credentials()?;
        let config = build_telemetry_config(&info.hostname, &info.ca_pem, fields);
        let jws = sign_config_jws(&client_secret, &config);

        let api = VehicleApi::new(&self.client);
        match api
            .fleet_telemetry_config_create(&[self.vin.clone()], &jws)
            .await
        {
            Ok(_) => {
                tracing::info!(vin = %self.vin, "fleet telemetry configured");
                Ok(())
            }
            Err(ApiError::MissingScopes(_)) if interactive => {
                eprintln!();
                eprintln!("Your token is missing scopes required for telemetry streaming.");
                self.interactive_reauthorize().await?;
                let api = VehicleApi::new(&self.client);
                api.fleet_telemetry_config_create(&[self.vin.clone()], &jws)
                    .await?;
                tracing::info!(vin = %self.vin, "fleet telemetry configured after re-auth");
                Ok(())
            }
            Err(ApiError::MissingScopes(_)) => Err(TunnelError::new(
                "token is missing required scopes for telemetry streaming; \
                 re-authenticate with the full scope set and retry",
            )
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Console-driven authorization-code flow with the full scope set.
    async fn interactive_reauthorize(&mut self) -> anyhow::Result<()> {
        let (client_id, client_secret) = self.partner_credentials()?;
        let verifier = generate_code_verifier();
        let challenge = code_challenge_s256(&verifier);
        let redirect_uri = "http://localhost:8085/callback";

        let auth_url = build_auth_url(
            AUTHORIZE_URL,
            &client_id,
            redirect_uri,
            DEFAULT_SCOPES,
            &challenge,
            "fleetgate-reauth",
        );
        eprintln!("Open this URL, approve all scopes, and paste the 'code' parameter");
        eprintln!("from the redirect back here:");
        eprintln!("  {auth_url}");
        eprint!("code> ");

        let code = read_line().await?;
        let tokens = exchange_code(
            TOKEN_URL,
            code.trim(),
            &verifier,
            &client_id,
            Some(&client_secret),
            redirect_uri,
        )
        .await?;
        self.client.update_token(tokens.access_token.clone());
        Ok(())
    }

    fn partner_credentials(&self) -> Result<(String, String), TunnelError> {
        match (&self.settings.client_id, &self.settings.client_secret) {
            (Some(id), Some(secret)) => Ok((id.clone(), secret.clone())),
            _ => Err(TunnelError::new(
                "client credentials required for partner operations; \
                 set FLEETGATE_CLIENT_ID and FLEETGATE_CLIENT_SECRET",
            )),
        }
    }

    /// Reverse-order teardown. Every step tolerates failure and the
    /// remaining steps still run.
    pub async fn shutdown(mut self) {
        if self.config_created {
            tracing::info!(vin = %self.vin, "removing fleet telemetry config");
            let api = VehicleApi::new(&self.client);
            if let Err(error) = api.fleet_telemetry_config_delete(&self.vin).await {
                tracing::warn!(%error, "failed to remove telemetry config; it will expire");
            }
            self.config_created = false;
        }

        if let Some(original) = self.original_domain.take() {
            tracing::info!(domain = %original, "restoring registered partner domain");
            match self.partner_credentials() {
                Ok((client_id, client_secret)) => {
                    if let Err(error) = register_partner_account(
                        self.client.base_url(),
                        TOKEN_URL,
                        &client_id,
                        &client_secret,
                        &original,
                    )
                    .await
                    {
                        tracing::warn!(%error, "failed to restore partner domain");
                    }
                }
                Err(error) => tracing::warn!(%error, "cannot restore partner domain"),
            }
        }

        self.tunnel.stop_funnel().await;
    }
}

/// Block on a newline from stdin without stalling the event loop.
async fn wait_for_enter() {
    let _ = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    })
    .await;
}

async fn read_line() -> anyhow::Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        std::io::stdin().read_line(&mut line)?;
        Ok(line)
    })
    .await?
}

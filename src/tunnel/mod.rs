//! Public tunnel management via the Tailscale CLI.
//!
//! Funnel terminates TLS at the tailnet edge and proxies HTTPS traffic
//! to a local plain-HTTP port, which is what lets the provider push
//! telemetry to this machine without any port forwarding.

use std::path::PathBuf;
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;

use crate::error::TunnelError;

/// An active public tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub url: String,
    pub hostname: String,
    pub ca_pem: String,
}

/// Wrapper around the `tailscale` CLI.
pub struct TunnelManager {
    binary: String,
    /// Where the fetched certificate chain is written.
    cert_dir: Option<PathBuf>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            binary: "tailscale".to_string(),
            cert_dir: None,
        }
    }

    pub fn with_cert_dir(mut self, dir: PathBuf) -> Self {
        self.cert_dir = Some(dir);
        self
    }

    async fn run(&self, args: &[&str]) -> Result<String, TunnelError> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TunnelError::new(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TunnelError::new(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Whether the CLI is installed at all.
    pub async fn check_available(&self) -> Result<(), TunnelError> {
        self.run(&["version"]).await.map(|_| ()).map_err(|_| {
            TunnelError::new(
                "tailscale CLI not found; install it and join a tailnet to use --tunnel",
            )
        })
    }

    async fn status_json(&self) -> Result<Value, TunnelError> {
        let raw = self.run(&["status", "--json"]).await?;
        serde_json::from_str(&raw)
            .map_err(|e| TunnelError::new(format!("unparseable tailscale status: {e}")))
    }

    /// Whether the daemon is up and logged in.
    pub async fn check_running(&self) -> Result<(), TunnelError> {
        let status = self.status_json().await?;
        match status.get("BackendState").and_then(Value::as_str) {
            Some("Running") => Ok(()),
            Some(state) => Err(TunnelError::new(format!(
                "tailscale backend is {state}; run 'tailscale up' first"
            ))),
            None => Err(TunnelError::new("tailscale status reported no backend state")),
        }
    }

    /// Whether the public-exposure (Funnel) feature is enabled for this
    /// node.
    pub async fn check_funnel_available(&self) -> Result<(), TunnelError> {
        // `funnel status` exits non-zero when the feature is unavailable.
        self.run(&["funnel", "status"]).await.map(|_| ()).map_err(|_| {
            TunnelError::new(
                "Funnel is not available on this node; enable it in the tailnet admin console",
            )
        })
    }

    /// The node's DNS hostname (without trailing dot).
    pub async fn get_hostname(&self) -> Result<String, TunnelError> {
        let status = self.status_json().await?;
        status
            .pointer("/Self/DNSName")
            .and_then(Value::as_str)
            .map(|name| name.trim_end_matches('.').to_string())
            .ok_or_else(|| TunnelError::new("tailscale status has no DNS name"))
    }

    /// Fetch the node's certificate chain PEM (used as the CA in the
    /// telemetry configuration).
    pub async fn get_cert_pem(&self, hostname: &str) -> Result<String, TunnelError> {
        let dir = self
            .cert_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&dir)
            .map_err(|e| TunnelError::new(format!("cannot create cert dir: {e}")))?;
        let cert_path = dir.join(format!("{hostname}.crt"));
        let key_path = dir.join(format!("{hostname}.key"));

        self.run(&[
            "cert",
            "--cert-file",
            &cert_path.to_string_lossy(),
            "--key-file",
            &key_path.to_string_lossy(),
            hostname,
        ])
        .await?;

        std::fs::read_to_string(&cert_path)
            .map_err(|e| TunnelError::new(format!("cannot read fetched certificate: {e}")))
    }

    /// Start a public HTTPS tunnel to `port` and return its coordinates.
    pub async fn start_funnel(&self, port: u16) -> Result<TunnelInfo, TunnelError> {
        self.run(&["funnel", "--bg", &port.to_string()]).await?;

        let hostname = self.get_hostname().await?;
        let ca_pem = match self.get_cert_pem(&hostname).await {
            Ok(pem) => pem,
            Err(error) => {
                tracing::warn!(%error, "could not fetch tunnel certificate; sending empty CA");
                String::new()
            }
        };

        tracing::info!(%hostname, port, "public tunnel active");
        Ok(TunnelInfo {
            url: format!("https://{hostname}"),
            hostname,
            ca_pem,
        })
    }

    /// Tear the tunnel down. Never fails — the shutdown path must not
    /// raise because a stop failed.
    pub async fn stop_funnel(&self) {
        if let Err(error) = self.run(&["funnel", "reset"]).await {
            tracing::warn!(%error, "failed to stop tunnel");
        } else {
            tracing::info!("public tunnel stopped");
        }
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing_binary() -> TunnelManager {
        TunnelManager {
            binary: "/nonexistent/tailscale-binary".to_string(),
            cert_dir: None,
        }
    }

    #[tokio::test]
    async fn test_check_available_reports_missing_cli() {
        let err = missing_binary().check_available().await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_stop_funnel_never_fails() {
        // Missing binary: stop still returns without error.
        missing_binary().stop_funnel().await;
    }
}

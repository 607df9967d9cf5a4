//! Bridge configuration.
//!
//! Loaded from `bridge.toml` under the config directory, then overridden
//! by CLI flags. The per-field filter table drives the dual-gate filter.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-field configuration for the dual-gate filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldFilter {
    /// Disabled fields never emit.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delta threshold; units depend on the field (meters, percent,
    /// degrees). Zero means any change emits.
    #[serde(default)]
    pub granularity: f64,
    /// Minimum seconds between emissions.
    #[serde(default)]
    pub throttle_seconds: f64,
    /// Maximum seconds of silence before forcing an emission regardless
    /// of delta. Zero disables the staleness gate.
    #[serde(default)]
    pub max_seconds: f64,
}

fn default_true() -> bool {
    true
}

impl FieldFilter {
    pub fn new(granularity: f64, throttle_seconds: f64) -> Self {
        Self {
            enabled: true,
            granularity,
            throttle_seconds,
            max_seconds: 0.0,
        }
    }

    pub fn with_max_seconds(mut self, max_seconds: f64) -> Self {
        self.max_seconds = max_seconds;
        self
    }
}

/// Default filters: thresholds low enough that events flow freely while
/// still deduplicating identical values.
pub fn default_filters() -> HashMap<String, FieldFilter> {
    let mut filters = HashMap::new();
    filters.insert(
        "Location".to_string(),
        FieldFilter::new(5.0, 1.0).with_max_seconds(60.0),
    );
    filters.insert(
        "Soc".to_string(),
        FieldFilter::new(0.5, 10.0).with_max_seconds(120.0),
    );
    filters.insert(
        "InsideTemp".to_string(),
        FieldFilter::new(0.5, 10.0).with_max_seconds(60.0),
    );
    filters.insert(
        "OutsideTemp".to_string(),
        FieldFilter::new(0.5, 10.0).with_max_seconds(60.0),
    );
    filters.insert(
        "VehicleSpeed".to_string(),
        FieldFilter::new(1.0, 2.0).with_max_seconds(30.0),
    );
    filters.insert("ChargeState".to_string(), FieldFilter::new(0.0, 0.0));
    filters.insert("DetailedChargeState".to_string(), FieldFilter::new(0.0, 0.0));
    filters.insert("Locked".to_string(), FieldFilter::new(0.0, 0.0));
    filters.insert("SentryMode".to_string(), FieldFilter::new(0.0, 0.0));
    filters.insert(
        "BatteryLevel".to_string(),
        FieldFilter::new(0.1, 10.0).with_max_seconds(120.0),
    );
    filters.insert(
        "EstBatteryRange".to_string(),
        FieldFilter::new(1.0, 10.0).with_max_seconds(120.0),
    );
    filters.insert(
        "Odometer".to_string(),
        FieldFilter::new(0.1, 30.0).with_max_seconds(300.0),
    );
    filters.insert("Gear".to_string(), FieldFilter::new(0.0, 0.0));
    filters.insert("DefrostMode".to_string(), FieldFilter::new(0.0, 0.0));
    filters
}

/// Configuration for the outbound gateway bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub gateway_token: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub client_version: Option<String>,
    #[serde(default = "default_filters")]
    pub telemetry: HashMap<String, FieldFilter>,
}

fn default_gateway_url() -> String {
    "ws://127.0.0.1:18789".to_string()
}

fn default_client_id() -> String {
    "fleetgate-bridge".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            gateway_token: None,
            client_id: default_client_id(),
            client_version: None,
            telemetry: default_filters(),
        }
    }
}

impl BridgeConfig {
    /// Load from a TOML file; missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::new(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| ConfigError::new(format!("invalid bridge config {}: {e}", path.display())))
    }

    /// Apply CLI flag overrides, returning the merged config.
    pub fn merge_overrides(
        mut self,
        gateway_url: Option<&str>,
        gateway_token: Option<&str>,
    ) -> Self {
        if let Some(url) = gateway_url {
            self.gateway_url = url.to_string();
        }
        if let Some(token) = gateway_token {
            self.gateway_token = Some(token.to_string());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_core_fields() {
        let filters = default_filters();
        assert!(filters["ChargeState"].enabled);
        assert_eq!(filters["ChargeState"].granularity, 0.0);
        assert_eq!(filters["Location"].granularity, 5.0);
        assert_eq!(filters["Odometer"].max_seconds, 300.0);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let cfg = BridgeConfig::load(Path::new("/nonexistent/bridge.toml")).unwrap();
        assert_eq!(cfg.gateway_url, "ws://127.0.0.1:18789");
    }

    #[test]
    fn test_merge_overrides() {
        let cfg = BridgeConfig::default().merge_overrides(Some("ws://gw:1"), Some("tok"));
        assert_eq!(cfg.gateway_url, "ws://gw:1");
        assert_eq!(cfg.gateway_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            r#"
gateway_url = "wss://gw.example:18789"

[telemetry.Soc]
granularity = 2.0
throttle_seconds = 5.0
"#,
        )
        .unwrap();

        let cfg = BridgeConfig::load(&path).unwrap();
        assert_eq!(cfg.gateway_url, "wss://gw.example:18789");
        assert_eq!(cfg.telemetry["Soc"].granularity, 2.0);
        assert!(cfg.telemetry["Soc"].enabled);
    }
}

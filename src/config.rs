//! Application settings.
//!
//! Populated from `FLEETGATE_*` environment variables (or an explicit map
//! for re-entrant tool invocations). There is intentionally no global
//! config: the value is built once in `main` and passed into every
//! component that needs it.

use std::collections::HashMap;
use std::path::PathBuf;

/// Regional Fleet API base URLs.
pub const REGION_BASE_URLS: &[(&str, &str)] = &[
    ("na", "https://fleet-api.prd.na.vn.cloud.fleetgate.example"),
    ("eu", "https://fleet-api.prd.eu.vn.cloud.fleetgate.example"),
];

/// OAuth endpoints on the provider side.
pub const AUTHORIZE_URL: &str = "https://auth.fleetgate.example/oauth2/v3/authorize";
pub const TOKEN_URL: &str = "https://auth.fleetgate.example/oauth2/v3/token";

/// Scopes requested during interactive login.
pub const DEFAULT_SCOPES: &[&str] = &[
    "openid",
    "offline_access",
    "vehicle_device_data",
    "vehicle_cmds",
    "vehicle_charging_cmds",
];

/// Application-wide settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// OAuth client id registered with the provider.
    pub client_id: Option<String>,
    /// OAuth client secret.
    pub client_secret: Option<String>,
    /// Partner domain currently registered with the provider.
    pub domain: Option<String>,
    /// Default vehicle identifier.
    pub vin: Option<String>,
    /// Provider region key (`na`, `eu`).
    pub region: String,
    /// Bearer token for the Fleet API.
    pub access_token: Option<String>,
    /// Refresh token for the Fleet API.
    pub refresh_token: Option<String>,
    /// Base directory for cache, keys, logs, and the serve directory.
    pub config_dir: PathBuf,
    /// Override for the Fleet API base URL (tests point this at a mock).
    pub api_base: Option<String>,
    /// Response cache default TTL in seconds.
    pub cache_ttl: u64,
    /// Whether the response cache is enabled.
    pub cache_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            domain: None,
            vin: None,
            region: "na".to_string(),
            access_token: None,
            refresh_token: None,
            config_dir: default_config_dir(),
            api_base: None,
            cache_ttl: 300,
            cache_enabled: true,
        }
    }
}

fn default_config_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fleetgate")
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Build settings from an explicit environment map.
    ///
    /// Tool invocations pass the inherited environment through here so a
    /// re-entrant dispatch sees the same configuration as a shell user.
    pub fn from_map(env: &HashMap<String, String>) -> Self {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();
        let defaults = Self::default();

        Self {
            client_id: get("FLEETGATE_CLIENT_ID"),
            client_secret: get("FLEETGATE_CLIENT_SECRET"),
            domain: get("FLEETGATE_DOMAIN"),
            vin: get("FLEETGATE_VIN"),
            region: get("FLEETGATE_REGION").unwrap_or(defaults.region),
            access_token: get("FLEETGATE_ACCESS_TOKEN"),
            refresh_token: get("FLEETGATE_REFRESH_TOKEN"),
            config_dir: get("FLEETGATE_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            api_base: get("FLEETGATE_API_BASE"),
            cache_ttl: get("FLEETGATE_CACHE_TTL")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_ttl),
            cache_enabled: get("FLEETGATE_CACHE_ENABLED")
                .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
                .unwrap_or(defaults.cache_enabled),
        }
    }

    /// Resolved Fleet API base URL for the configured region.
    pub fn api_base_url(&self) -> String {
        if let Some(base) = &self.api_base {
            return base.trim_end_matches('/').to_string();
        }
        REGION_BASE_URLS
            .iter()
            .find(|(region, _)| *region == self.region)
            .map(|(_, url)| (*url).to_string())
            .unwrap_or_else(|| REGION_BASE_URLS[0].1.to_string())
    }

    /// Directory holding the provisioned EC key pair.
    pub fn key_dir(&self) -> PathBuf {
        self.config_dir.join("keys")
    }

    /// Directory holding the CSV telemetry logs.
    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// Directory for the response cache database.
    pub fn cache_dir(&self) -> PathBuf {
        self.config_dir.join("cache")
    }
}

/// Resolve a VIN from the usual sources, in priority order:
/// positional argument > `--vin` flag > settings default.
pub fn resolve_vin(
    positional: Option<&str>,
    flag: Option<&str>,
    settings: &Settings,
) -> Option<String> {
    positional
        .or(flag)
        .map(str::to_string)
        .or_else(|| settings.vin.clone())
}

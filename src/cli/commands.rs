//! Subcommand executors.
//!
//! Every command produces exactly one JSON envelope. Reads go through
//! the response cache (telemetry keeps it warm during serve); writes go
//! through the command dispatcher, which signs and wake-retries.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::api::{FleetClient, VehicleApi};
use crate::bridge::CommandDispatcher;
use crate::cache::ResponseCache;
use crate::config::{resolve_vin, Settings};
use crate::error::{ApiError, ConfigError};
use crate::output;

use super::{
    AuthCmd, CacheCmd, ChargeCmd, Cli, ClimateCmd, Command, SecurityCmd, TrunkCmd, VehicleCmd,
};

/// Run one parsed command to a JSON envelope.
pub async fn run(cli: &Cli, settings: &Settings) -> Value {
    let (name, result) = execute(cli, settings).await;
    match result {
        Ok(data) => output::ok(&name, data),
        Err(e) => match e.downcast_ref::<ApiError>() {
            Some(api_err) => output::err(&name, api_err.code(), api_err.to_string()),
            None => match e.downcast_ref::<ConfigError>() {
                Some(cfg) => output::err(&name, "config_error", cfg.to_string()),
                None => output::err(&name, "error", e.to_string()),
            },
        },
    }
}

async fn execute(cli: &Cli, settings: &Settings) -> (String, anyhow::Result<Value>) {
    match &cli.command {
        Command::Vehicle { cmd } => {
            let name = format!("vehicle {}", vehicle_cmd_name(cmd));
            (name, run_vehicle(cmd, cli, settings).await)
        }
        Command::Charge { cmd } => {
            let name = format!("charge {}", charge_cmd_name(cmd));
            (name, run_charge(cmd, cli, settings).await)
        }
        Command::Climate { cmd } => {
            let name = format!("climate {}", climate_cmd_name(cmd));
            (name, run_climate(cmd, cli, settings).await)
        }
        Command::Security { cmd } => {
            let name = format!("security {}", security_cmd_name(cmd));
            (name, run_security(cmd, cli, settings).await)
        }
        Command::Trunk { cmd } => {
            let name = format!(
                "trunk {}",
                match cmd {
                    TrunkCmd::Open => "open",
                    TrunkCmd::Frunk => "frunk",
                }
            );
            let method = match cmd {
                TrunkCmd::Open => "trunk.open",
                TrunkCmd::Frunk => "frunk.open",
            };
            (name, run_write(method, json!({}), cli, settings).await)
        }
        Command::Cache { cmd } => {
            let name = format!(
                "cache {}",
                match cmd {
                    CacheCmd::Status => "status",
                    CacheCmd::Clear => "clear",
                }
            );
            (name, run_cache(cmd, cli, settings))
        }
        Command::Auth { cmd: AuthCmd::Status } => {
            ("auth status".to_string(), Ok(auth_status(settings)))
        }
        Command::Serve(_) => (
            "serve".to_string(),
            Err(anyhow::anyhow!("serve is handled by the binary entry point")),
        ),
    }
}

// -- shared plumbing --------------------------------------------------------

fn require_vin(cli: &Cli, settings: &Settings) -> Result<String, ConfigError> {
    resolve_vin(None, cli.vin.as_deref(), settings).ok_or_else(|| {
        ConfigError::new("no VIN specified; pass --vin or set FLEETGATE_VIN")
    })
}

fn build_client(settings: &Settings) -> Result<FleetClient, ConfigError> {
    let token = settings
        .access_token
        .clone()
        .ok_or_else(|| ConfigError::new("no access token; set FLEETGATE_ACCESS_TOKEN"))?;
    Ok(FleetClient::new(settings.api_base_url(), token))
}

fn open_cache(cli: &Cli, settings: &Settings) -> ResponseCache {
    let enabled = settings.cache_enabled && !cli.no_cache;
    match ResponseCache::open(settings.cache_dir(), settings.cache_ttl, enabled) {
        Ok(cache) => cache,
        Err(error) => {
            tracing::warn!(%error, "failed to open response cache; continuing without");
            ResponseCache::disabled()
        }
    }
}

fn build_dispatcher(cli: &Cli, settings: &Settings) -> anyhow::Result<Arc<CommandDispatcher>> {
    let vin = require_vin(cli, settings)?;
    let client = build_client(settings)?;
    let cache = open_cache(cli, settings);
    let session_key = settings
        .client_secret
        .clone()
        .unwrap_or_else(|| "fleetgate-local-session".to_string());
    Ok(Arc::new(CommandDispatcher::new(
        vin,
        client,
        cache,
        None,
        session_key.as_bytes(),
    )))
}

/// Cached vehicle snapshot: disk cache first, then the API (with a
/// single wake-retry under `--wake`), writing back on success.
async fn cached_vehicle_data(cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    let vin = require_vin(cli, settings)?;
    let cache = open_cache(cli, settings);

    if let Some(entry) = cache.get(&vin) {
        tracing::debug!(vin = %vin, age = entry.age_seconds(), "cache hit");
        return Ok(entry.data);
    }

    let client = build_client(settings)?;
    let api = VehicleApi::new(&client);
    let data = match api.get_vehicle_data(&vin, None).await {
        Err(ApiError::VehicleAsleep) if cli.wake => {
            api.wake(&vin).await?;
            api.get_vehicle_data(&vin, None).await?
        }
        other => other?,
    };

    if let Err(error) = cache.put(&vin, data.clone(), None) {
        tracing::warn!(%error, "failed to cache vehicle data");
    }
    if let Err(error) = cache.put_wake_state(&vin, true, None) {
        tracing::warn!(%error, "failed to cache wake state");
    }
    Ok(data)
}

async fn run_write(
    method: &str,
    params: Value,
    cli: &Cli,
    settings: &Settings,
) -> anyhow::Result<Value> {
    let dispatcher = build_dispatcher(cli, settings)?;
    dispatcher
        .dispatch(method, &params)
        .await?
        .ok_or_else(|| anyhow::anyhow!("unknown method: {method}"))
}

// -- vehicle ----------------------------------------------------------------

fn vehicle_cmd_name(cmd: &VehicleCmd) -> &'static str {
    match cmd {
        VehicleCmd::List => "list",
        VehicleCmd::Info => "info",
        VehicleCmd::Data => "data",
        VehicleCmd::Location => "location",
        VehicleCmd::Wake => "wake",
    }
}

async fn run_vehicle(cmd: &VehicleCmd, cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    match cmd {
        VehicleCmd::List => {
            let client = build_client(settings)?;
            let vehicles = VehicleApi::new(&client).list_vehicles().await?;
            let count = vehicles.len();
            Ok(json!({"vehicles": vehicles, "count": count}))
        }
        VehicleCmd::Info => {
            let data = cached_vehicle_data(cli, settings).await?;
            Ok(json!({
                "vin": data.get("vin"),
                "state": data.get("state"),
                "battery_level": data.pointer("/charge_state/battery_level"),
                "charging_state": data.pointer("/charge_state/charging_state"),
                "inside_temp": data.pointer("/climate_state/inside_temp"),
                "locked": data.pointer("/vehicle_state/locked"),
                "odometer": data.pointer("/vehicle_state/odometer"),
                "car_version": data.pointer("/vehicle_state/car_version"),
            }))
        }
        VehicleCmd::Data => cached_vehicle_data(cli, settings).await,
        VehicleCmd::Location => {
            let data = cached_vehicle_data(cli, settings).await?;
            Ok(json!({
                "latitude": data.pointer("/drive_state/latitude"),
                "longitude": data.pointer("/drive_state/longitude"),
                "heading": data.pointer("/drive_state/heading"),
                "speed": data.pointer("/drive_state/speed"),
            }))
        }
        VehicleCmd::Wake => {
            let vin = require_vin(cli, settings)?;
            let client = build_client(settings)?;
            let state = VehicleApi::new(&client).wake(&vin).await?;
            Ok(json!({"state": state.get("state")}))
        }
    }
}

// -- charge -----------------------------------------------------------------

fn charge_cmd_name(cmd: &ChargeCmd) -> &'static str {
    match cmd {
        ChargeCmd::Status => "status",
        ChargeCmd::Start => "start",
        ChargeCmd::Stop => "stop",
        ChargeCmd::Limit { .. } => "limit",
        ChargeCmd::Amps { .. } => "amps",
        ChargeCmd::PortOpen => "port-open",
        ChargeCmd::PortClose => "port-close",
    }
}

async fn run_charge(cmd: &ChargeCmd, cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    match cmd {
        ChargeCmd::Status => {
            let data = cached_vehicle_data(cli, settings).await?;
            Ok(data.pointer("/charge_state").cloned().unwrap_or(json!({})))
        }
        ChargeCmd::Start => run_write("charge.start", json!({}), cli, settings).await,
        ChargeCmd::Stop => run_write("charge.stop", json!({}), cli, settings).await,
        ChargeCmd::Limit { percent } => {
            run_write("charge.set_limit", json!({"percent": percent}), cli, settings).await
        }
        ChargeCmd::Amps { amps } => {
            let dispatcher = build_dispatcher(cli, settings)?;
            dispatcher
                .execute_command("set_charging_amps", Some(json!({"charging_amps": amps})))
                .await
        }
        ChargeCmd::PortOpen => {
            let dispatcher = build_dispatcher(cli, settings)?;
            dispatcher.execute_command("charge_port_door_open", None).await
        }
        ChargeCmd::PortClose => {
            let dispatcher = build_dispatcher(cli, settings)?;
            dispatcher.execute_command("charge_port_door_close", None).await
        }
    }
}

// -- climate ----------------------------------------------------------------

fn climate_cmd_name(cmd: &ClimateCmd) -> &'static str {
    match cmd {
        ClimateCmd::Status => "status",
        ClimateCmd::On => "on",
        ClimateCmd::Off => "off",
        ClimateCmd::Set { .. } => "set",
        ClimateCmd::Seat { .. } => "seat",
    }
}

async fn run_climate(cmd: &ClimateCmd, cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    match cmd {
        ClimateCmd::Status => {
            let data = cached_vehicle_data(cli, settings).await?;
            Ok(data.pointer("/climate_state").cloned().unwrap_or(json!({})))
        }
        ClimateCmd::On => run_write("climate.on", json!({}), cli, settings).await,
        ClimateCmd::Off => run_write("climate.off", json!({}), cli, settings).await,
        ClimateCmd::Set { temp } => {
            run_write("climate.set_temp", json!({"temp": temp}), cli, settings).await
        }
        ClimateCmd::Seat { position, level } => {
            let heater = match position.as_str() {
                "driver" => 0,
                "passenger" => 1,
                "rear-left" => 2,
                "rear-center" => 4,
                "rear-right" => 5,
                other => anyhow::bail!("unknown seat position: {other}"),
            };
            let dispatcher = build_dispatcher(cli, settings)?;
            dispatcher
                .execute_command(
                    "set_seat_heater",
                    Some(json!({"heater": heater, "level": level})),
                )
                .await
        }
    }
}

// -- security ---------------------------------------------------------------

fn security_cmd_name(cmd: &SecurityCmd) -> &'static str {
    match cmd {
        SecurityCmd::Status => "status",
        SecurityCmd::Lock => "lock",
        SecurityCmd::Unlock => "unlock",
        SecurityCmd::Sentry { .. } => "sentry",
        SecurityCmd::Flash => "flash",
        SecurityCmd::Honk => "honk",
    }
}

async fn run_security(cmd: &SecurityCmd, cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    match cmd {
        SecurityCmd::Status => {
            let data = cached_vehicle_data(cli, settings).await?;
            Ok(json!({
                "locked": data.pointer("/vehicle_state/locked"),
                "sentry_mode": data.pointer("/vehicle_state/sentry_mode"),
            }))
        }
        SecurityCmd::Lock => run_write("door.lock", json!({}), cli, settings).await,
        SecurityCmd::Unlock => run_write("door.unlock", json!({}), cli, settings).await,
        SecurityCmd::Sentry { state } => {
            let method = match state.as_str() {
                "on" => "sentry.on",
                "off" => "sentry.off",
                other => anyhow::bail!("sentry takes 'on' or 'off', got '{other}'"),
            };
            run_write(method, json!({}), cli, settings).await
        }
        SecurityCmd::Flash => run_write("flash_lights", json!({}), cli, settings).await,
        SecurityCmd::Honk => run_write("honk_horn", json!({}), cli, settings).await,
    }
}

// -- cache / auth -----------------------------------------------------------

fn run_cache(cmd: &CacheCmd, cli: &Cli, settings: &Settings) -> anyhow::Result<Value> {
    let cache = open_cache(cli, settings);
    match cmd {
        CacheCmd::Status => Ok(serde_json::to_value(cache.status())?),
        CacheCmd::Clear => {
            let vin = resolve_vin(None, cli.vin.as_deref(), settings);
            let removed = cache.clear(vin.as_deref())?;
            Ok(json!({"cleared": removed}))
        }
    }
}

fn auth_status(settings: &Settings) -> Value {
    json!({
        "has_access_token": settings.access_token.is_some(),
        "has_refresh_token": settings.refresh_token.is_some(),
        "region": settings.region,
        "client_id_configured": settings.client_id.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::collections::HashMap;

    fn settings_with_cache(dir: &std::path::Path) -> Settings {
        let mut env = HashMap::new();
        env.insert(
            "FLEETGATE_CONFIG_DIR".to_string(),
            dir.to_string_lossy().to_string(),
        );
        env.insert("FLEETGATE_VIN".to_string(), "V1".to_string());
        Settings::from_map(&env)
    }

    #[tokio::test]
    async fn test_vehicle_info_served_from_cache_without_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_cache(dir.path());

        // Warm the cache directly; no API base is configured, so any
        // upstream call would fail the test.
        let cache = ResponseCache::open(settings.cache_dir(), 120, true).unwrap();
        cache
            .put(
                "V1",
                json!({"vin": "V1", "charge_state": {"battery_level": 80}}),
                Some(120),
            )
            .unwrap();
        drop(cache);

        let cli = Cli::try_parse_from(["fleetgate", "vehicle", "info"]).unwrap();
        let envelope = run(&cli, &settings).await;

        assert_eq!(envelope["ok"], true);
        assert_eq!(envelope["command"], "vehicle info");
        assert_eq!(envelope["data"]["battery_level"], 80);
    }

    #[tokio::test]
    async fn test_missing_vin_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert(
            "FLEETGATE_CONFIG_DIR".to_string(),
            dir.path().to_string_lossy().to_string(),
        );
        let settings = Settings::from_map(&env);

        let cli = Cli::try_parse_from(["fleetgate", "vehicle", "data"]).unwrap();
        let envelope = run(&cli, &settings).await;
        assert_eq!(envelope["ok"], false);
        assert_eq!(envelope["error"]["code"], "config_error");
    }

    #[tokio::test]
    async fn test_cache_status_command() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_with_cache(dir.path());

        let cli = Cli::try_parse_from(["fleetgate", "cache", "status"]).unwrap();
        let envelope = run(&cli, &settings).await;
        assert_eq!(envelope["ok"], true);
        assert_eq!(envelope["data"]["enabled"], true);
        assert_eq!(envelope["data"]["total_entries"], 0);
    }

    #[tokio::test]
    async fn test_auth_status_reports_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = settings_with_cache(dir.path());
        settings.access_token = Some("tok".to_string());

        let cli = Cli::try_parse_from(["fleetgate", "auth", "status"]).unwrap();
        let envelope = run(&cli, &settings).await;
        assert_eq!(envelope["data"]["has_access_token"], true);
        assert_eq!(envelope["data"]["has_refresh_token"], false);
    }
}

//! Command dispatcher: resolves inbound tool invocations to either a
//! cached read (telemetry store first, vehicle snapshot second) or a
//! signed outbound command with one-retry auto-wake.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};

use crate::api::{FleetClient, VehicleApi};
use crate::cache::ResponseCache;
use crate::error::ApiError;
use crate::protocol::CommandSession;
use crate::telemetry::store::TelemetryStore;

/// Wake-poll backoff: start, factor, cap, and total budget.
const WAKE_POLL_INITIAL: Duration = Duration::from_secs(20);
const WAKE_POLL_FACTOR: f64 = 1.5;
const WAKE_POLL_MAX: Duration = Duration::from_secs(30);
const WAKE_POLL_BUDGET: Duration = Duration::from_secs(90);

/// Routing domain of a vehicle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDomain {
    Vcsec,
    Infotainment,
    Broadcast,
}

/// Static description of one vehicle command.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub domain: CommandDomain,
    pub requires_signing: bool,
    pub action_type: &'static str,
}

/// Command registry: upstream command name → spec.
#[rustfmt::skip]
static COMMAND_SPECS: &[CommandSpec] = &[
    CommandSpec { name: "door_lock",                domain: CommandDomain::Vcsec,        requires_signing: true,  action_type: "security" },
    CommandSpec { name: "door_unlock",              domain: CommandDomain::Vcsec,        requires_signing: true,  action_type: "security" },
    CommandSpec { name: "auto_conditioning_start",  domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "climate" },
    CommandSpec { name: "auto_conditioning_stop",   domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "climate" },
    CommandSpec { name: "set_temps",                domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "climate" },
    CommandSpec { name: "charge_start",             domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "charge_stop",              domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "set_charge_limit",         domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "set_charging_amps",        domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "charge_port_door_open",    domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "charge_port_door_close",   domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "charging" },
    CommandSpec { name: "actuate_trunk",            domain: CommandDomain::Vcsec,        requires_signing: true,  action_type: "body" },
    CommandSpec { name: "set_sentry_mode",          domain: CommandDomain::Vcsec,        requires_signing: true,  action_type: "security" },
    CommandSpec { name: "set_seat_heater",          domain: CommandDomain::Infotainment, requires_signing: true,  action_type: "climate" },
    CommandSpec { name: "flash_lights",             domain: CommandDomain::Broadcast,    requires_signing: false, action_type: "alert" },
    CommandSpec { name: "honk_horn",                domain: CommandDomain::Broadcast,    requires_signing: false, action_type: "alert" },
];

/// Look up a command spec by upstream name.
pub fn command_spec(name: &str) -> Option<&'static CommandSpec> {
    COMMAND_SPECS.iter().find(|spec| spec.name == name)
}

/// Dispatches gateway/tool methods to the Fleet API with telemetry-first
/// reads and wake-retry writes.
pub struct CommandDispatcher {
    vin: String,
    client: FleetClient,
    cache: ResponseCache,
    store: Option<Arc<TelemetryStore>>,
    session: tokio::sync::Mutex<CommandSession>,
    snapshot: Arc<tokio::sync::Mutex<Option<Value>>>,
    fetch_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CommandDispatcher {
    pub fn new(
        vin: impl Into<String>,
        client: FleetClient,
        cache: ResponseCache,
        store: Option<Arc<TelemetryStore>>,
        session_key: &[u8],
    ) -> Self {
        Self {
            vin: vin.into(),
            client,
            cache,
            store,
            session: tokio::sync::Mutex::new(CommandSession::new(session_key)),
            snapshot: Arc::new(tokio::sync::Mutex::new(None)),
            fetch_task: std::sync::Mutex::new(None),
        }
    }

    /// Dispatch one method. Returns `None` for unknown methods so the
    /// caller can produce its own error response.
    pub async fn dispatch(
        self: &Arc<Self>,
        method: &str,
        params: &Value,
    ) -> anyhow::Result<Option<Value>> {
        tracing::debug!(method, "dispatch");
        let result = match method {
            // Reads
            "location.get" => Some(self.handle_location_get().await),
            "battery.get" => Some(self.handle_battery_get().await),
            "temperature.get" => Some(self.handle_temperature_get().await),
            "speed.get" => Some(self.handle_speed_get().await),
            "charge_state.get" => Some(self.handle_charge_state_get().await),
            "security.get" => Some(self.handle_security_get().await),
            // Writes
            "door.lock" => Some(self.execute_command("door_lock", None).await?),
            "door.unlock" => Some(self.execute_command("door_unlock", None).await?),
            "climate.on" => Some(self.execute_command("auto_conditioning_start", None).await?),
            "climate.off" => Some(self.execute_command("auto_conditioning_stop", None).await?),
            "climate.set_temp" => {
                let temp = params
                    .get("temp")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| anyhow::anyhow!("climate.set_temp requires 'temp' parameter"))?;
                Some(
                    self.execute_command(
                        "set_temps",
                        Some(json!({"driver_temp": temp, "passenger_temp": temp})),
                    )
                    .await?,
                )
            }
            "charge.start" => Some(self.execute_command("charge_start", None).await?),
            "charge.stop" => Some(self.execute_command("charge_stop", None).await?),
            "charge.set_limit" => {
                let percent = params.get("percent").and_then(Value::as_i64).ok_or_else(|| {
                    anyhow::anyhow!("charge.set_limit requires 'percent' parameter")
                })?;
                Some(
                    self.execute_command("set_charge_limit", Some(json!({"percent": percent})))
                        .await?,
                )
            }
            "trunk.open" => Some(
                self.execute_command("actuate_trunk", Some(json!({"which_trunk": "rear"})))
                    .await?,
            ),
            "frunk.open" => Some(
                self.execute_command("actuate_trunk", Some(json!({"which_trunk": "front"})))
                    .await?,
            ),
            "flash_lights" => Some(self.execute_command("flash_lights", None).await?),
            "honk_horn" => Some(self.execute_command("honk_horn", None).await?),
            "sentry.on" => Some(
                self.execute_command("set_sentry_mode", Some(json!({"on": true})))
                    .await?,
            ),
            "sentry.off" => Some(
                self.execute_command("set_sentry_mode", Some(json!({"on": false})))
                    .await?,
            ),
            _ => {
                tracing::warn!(method, "no handler for method");
                None
            }
        };
        Ok(result)
    }

    // -- Read path ----------------------------------------------------------

    fn store_value(&self, field: &str) -> Option<Value> {
        self.store
            .as_ref()
            .and_then(|store| store.get(field))
            .map(|snap| snap.value.to_json())
    }

    /// Section of the per-request vehicle snapshot, or `None` with a
    /// background fetch scheduled.
    async fn snapshot_section(self: &Arc<Self>, section: &str) -> Option<Value> {
        let snapshot = self.snapshot.lock().await;
        match snapshot.as_ref() {
            Some(data) => Some(data.get(section).cloned().unwrap_or(json!({}))),
            None => {
                drop(snapshot);
                self.schedule_snapshot_fetch();
                None
            }
        }
    }

    /// Kick off one background snapshot fetch; at most one outstanding
    /// per dispatcher.
    fn schedule_snapshot_fetch(self: &Arc<Self>) {
        let mut task = match self.fetch_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let dispatcher = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            match dispatcher.fetch_snapshot().await {
                Ok(data) => {
                    *dispatcher.snapshot.lock().await = Some(data);
                    tracing::info!("background vehicle snapshot fetch complete");
                }
                Err(error) => {
                    tracing::warn!(%error, "background vehicle snapshot fetch failed");
                }
            }
        }));
    }

    async fn fetch_snapshot(&self) -> Result<Value, ApiError> {
        let api = VehicleApi::new(&self.client);
        match api.get_vehicle_data(&self.vin, None).await {
            Err(ApiError::VehicleAsleep) => {
                self.wake_and_wait().await?;
                api.get_vehicle_data(&self.vin, None).await
            }
            other => other,
        }
    }

    async fn handle_location_get(self: &Arc<Self>) -> Value {
        if let Some(loc) = self.store_value("Location") {
            return json!({
                "latitude": loc.get("latitude"),
                "longitude": loc.get("longitude"),
            });
        }
        match self.snapshot_section("drive_state").await {
            Some(drive) => json!({
                "latitude": drive.get("latitude"),
                "longitude": drive.get("longitude"),
                "heading": drive.get("heading"),
                "speed": drive.get("speed"),
            }),
            None => json!({"pending": true}),
        }
    }

    async fn handle_battery_get(self: &Arc<Self>) -> Value {
        let soc = self.store_value("Soc").or_else(|| self.store_value("BatteryLevel"));
        if let Some(level) = soc {
            let mut result = json!({"battery_level": level});
            if let Some(range) = self.store_value("EstBatteryRange") {
                result["range_miles"] = range;
            }
            return result;
        }
        match self.snapshot_section("charge_state").await {
            Some(cs) => json!({
                "battery_level": cs.get("battery_level"),
                "range_miles": cs.get("battery_range"),
            }),
            None => json!({"pending": true}),
        }
    }

    async fn handle_temperature_get(self: &Arc<Self>) -> Value {
        let inside = self.store_value("InsideTemp");
        let outside = self.store_value("OutsideTemp");
        if inside.is_some() || outside.is_some() {
            let mut result = json!({});
            if let Some(v) = inside {
                result["inside_temp_c"] = v;
            }
            if let Some(v) = outside {
                result["outside_temp_c"] = v;
            }
            return result;
        }
        match self.snapshot_section("climate_state").await {
            Some(climate) => json!({
                "inside_temp_c": climate.get("inside_temp"),
                "outside_temp_c": climate.get("outside_temp"),
            }),
            None => json!({"pending": true}),
        }
    }

    async fn handle_speed_get(self: &Arc<Self>) -> Value {
        if let Some(speed) = self.store_value("VehicleSpeed") {
            return json!({"speed_mph": speed});
        }
        match self.snapshot_section("drive_state").await {
            Some(drive) => json!({"speed_mph": drive.get("speed")}),
            None => json!({"pending": true}),
        }
    }

    async fn handle_charge_state_get(self: &Arc<Self>) -> Value {
        let state = self
            .store_value("ChargeState")
            .or_else(|| self.store_value("DetailedChargeState"));
        if let Some(state) = state {
            return json!({"charge_state": state});
        }
        match self.snapshot_section("charge_state").await {
            Some(cs) => json!({"charge_state": cs.get("charging_state")}),
            None => json!({"pending": true}),
        }
    }

    async fn handle_security_get(self: &Arc<Self>) -> Value {
        let locked = self.store_value("Locked");
        let sentry = self.store_value("SentryMode");
        if locked.is_some() || sentry.is_some() {
            let mut result = json!({});
            if let Some(v) = locked {
                result["locked"] = v;
            }
            if let Some(v) = sentry {
                result["sentry_mode"] = v;
            }
            return result;
        }
        match self.snapshot_section("vehicle_state").await {
            Some(vs) => json!({
                "locked": vs.get("locked"),
                "sentry_mode": vs.get("sentry_mode"),
            }),
            None => json!({"pending": true}),
        }
    }

    // -- Write path ---------------------------------------------------------

    /// Wake the vehicle and wait until it reports online, with bounded
    /// exponential backoff polling.
    async fn wake_and_wait(&self) -> Result<(), ApiError> {
        let api = VehicleApi::new(&self.client);
        tracing::info!(vin = %self.vin, "vehicle asleep; sending wake");
        let state = api.wake(&self.vin).await?;
        if state.get("state").and_then(Value::as_str) == Some("online") {
            return Ok(());
        }

        let started = std::time::Instant::now();
        let mut delay = WAKE_POLL_INITIAL;
        while started.elapsed() < WAKE_POLL_BUDGET {
            tokio::time::sleep(delay).await;
            delay = Duration::from_secs_f64((delay.as_secs_f64() * WAKE_POLL_FACTOR).min(
                WAKE_POLL_MAX.as_secs_f64(),
            ));

            let data = self
                .client
                .get(&format!("/api/1/vehicles/{}", self.vin))
                .await?;
            if data.pointer("/response/state").and_then(Value::as_str) == Some("online") {
                return Ok(());
            }
        }
        // Budget exhausted; let the retry surface the real state.
        Ok(())
    }

    /// Execute a vehicle command: resolve the spec, sign when required,
    /// POST with a single wake-and-retry on "asleep", and invalidate the
    /// cache on success.
    pub async fn execute_command(
        self: &Arc<Self>,
        command_name: &str,
        body: Option<Value>,
    ) -> anyhow::Result<Value> {
        let spec = command_spec(command_name)
            .ok_or_else(|| anyhow::anyhow!("unknown command: {command_name}"))?;

        let body = if spec.requires_signing {
            Some(self.sign_body(spec, body).await)
        } else {
            body
        };

        let api = VehicleApi::new(&self.client);
        let result = match api.command(&self.vin, command_name, body.clone()).await {
            Err(ApiError::VehicleAsleep) => {
                self.wake_and_wait().await?;
                api.command(&self.vin, command_name, body).await?
            }
            other => other?,
        };

        // Invalidate on success only; a failed write leaves cached data
        // intact until TTL.
        if let Err(error) = self.cache.clear(Some(&self.vin)) {
            tracing::warn!(%error, "cache invalidation failed after command");
        }

        Ok(json!({"result": result.result, "reason": result.reason}))
    }

    /// Attach TLV metadata and the HMAC tag to a command body.
    async fn sign_body(&self, spec: &CommandSpec, body: Option<Value>) -> Value {
        let mut body = body.unwrap_or_else(|| json!({}));
        let payload = body.to_string();

        let mut session = self.session.lock().await;
        let (metadata, tag) = session.sign(payload.as_bytes());

        body["signature"] = json!({
            "epoch": BASE64.encode(session.epoch()),
            "metadata": BASE64.encode(&metadata),
            "tag": BASE64.encode(tag),
            "counter": session.counter(),
            "domain": match spec.domain {
                CommandDomain::Vcsec => "vcsec",
                CommandDomain::Infotainment => "infotainment",
                CommandDomain::Broadcast => "broadcast",
            },
        });
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_lookup() {
        let spec = command_spec("door_lock").unwrap();
        assert_eq!(spec.domain, CommandDomain::Vcsec);
        assert!(spec.requires_signing);

        let spec = command_spec("honk_horn").unwrap();
        assert!(!spec.requires_signing);

        assert!(command_spec("warp_drive").is_none());
    }

    #[tokio::test]
    async fn test_reads_prefer_telemetry_store() {
        let store = Arc::new(TelemetryStore::new());
        store.update(
            "Soc",
            crate::telemetry::decoder::TelemetryValue::Int(72),
            chrono::Utc::now(),
        );

        // Client points at a dead address: any network call would error,
        // proving the read came from the store.
        let dispatcher = Arc::new(CommandDispatcher::new(
            "V1",
            FleetClient::new("http://127.0.0.1:1", "token"),
            ResponseCache::disabled(),
            Some(store),
            b"session-key",
        ));

        let result = dispatcher.dispatch("battery.get", &json!({})).await.unwrap();
        assert_eq!(result.unwrap()["battery_level"], 72);
    }

    #[tokio::test]
    async fn test_read_without_data_is_pending() {
        let dispatcher = Arc::new(CommandDispatcher::new(
            "V1",
            FleetClient::new("http://127.0.0.1:1", "token"),
            ResponseCache::disabled(),
            None,
            b"session-key",
        ));

        let result = dispatcher.dispatch("speed.get", &json!({})).await.unwrap();
        assert_eq!(result.unwrap()["pending"], true);
    }

    #[tokio::test]
    async fn test_unknown_method_returns_none() {
        let dispatcher = Arc::new(CommandDispatcher::new(
            "V1",
            FleetClient::new("http://127.0.0.1:1", "token"),
            ResponseCache::disabled(),
            None,
            b"session-key",
        ));
        let result = dispatcher.dispatch("media.volume", &json!({})).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_required_parameter_validation() {
        let dispatcher = Arc::new(CommandDispatcher::new(
            "V1",
            FleetClient::new("http://127.0.0.1:1", "token"),
            ResponseCache::disabled(),
            None,
            b"session-key",
        ));

        let err = dispatcher
            .dispatch("climate.set_temp", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires 'temp'"));

        let err = dispatcher
            .dispatch("charge.set_limit", &json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires 'percent'"));
    }
}

//! Telemetry field → vehicle-snapshot path mapping.
//!
//! Translates wire field names (`"Soc"`, `"Location"`, …) into dotted
//! paths in the structured vehicle snapshot
//! (`"charge_state.usable_battery_level"`, …). A single wire field may
//! produce multiple leaves (a location yields latitude and longitude).

use std::collections::HashMap;
use std::sync::OnceLock;

use serde_json::Value;

use super::decoder::TelemetryValue;

type Transform = fn(&TelemetryValue) -> Option<Value>;

/// One mapping from a wire field to a snapshot leaf.
#[derive(Clone, Copy)]
pub struct FieldMapping {
    /// Dotted path into the snapshot, e.g. `"charge_state.battery_level"`.
    pub path: &'static str,
    /// Transform for the raw value; `None` suppresses the leaf.
    pub transform: Transform,
}

// -- transforms -------------------------------------------------------------

fn to_int(v: &TelemetryValue) -> Option<Value> {
    v.as_f64().map(|f| Value::from(f.round() as i64))
}

fn to_float(v: &TelemetryValue) -> Option<Value> {
    v.as_f64().map(Value::from)
}

fn to_bool(v: &TelemetryValue) -> Option<Value> {
    match v {
        TelemetryValue::Bool(b) => Some(Value::Bool(*b)),
        TelemetryValue::Int(i) => Some(Value::Bool(*i != 0)),
        TelemetryValue::Float(f) => Some(Value::Bool(*f != 0.0)),
        TelemetryValue::Text(s) => Some(Value::Bool(matches!(
            s.to_lowercase().as_str(),
            "true" | "1" | "yes"
        ))),
        TelemetryValue::Location { .. } => None,
    }
}

fn to_str(v: &TelemetryValue) -> Option<Value> {
    match v {
        TelemetryValue::Location { .. } => None,
        other => Some(Value::String(other.to_string())),
    }
}

fn extract_lat(v: &TelemetryValue) -> Option<Value> {
    v.as_location().map(|(lat, _)| Value::from(lat))
}

fn extract_lon(v: &TelemetryValue) -> Option<Value> {
    v.as_location().map(|(_, lon)| Value::from(lon))
}

/// Map gear enum values onto the snapshot's shift-state letters.
fn gear_str(v: &TelemetryValue) -> Option<Value> {
    let s = v.to_string();
    let mapped = match s.as_str() {
        "P" | "Park" => "P",
        "R" | "Reverse" => "R",
        "N" | "Neutral" => "N",
        "D" | "Drive" | "DriveSport" => "D",
        "" => return None,
        other => other,
    };
    Some(Value::String(mapped.to_string()))
}

// -- table ------------------------------------------------------------------

macro_rules! mapping {
    ($path:literal, $transform:ident) => {
        FieldMapping {
            path: $path,
            transform: $transform,
        }
    };
}

fn field_map() -> &'static HashMap<&'static str, Vec<FieldMapping>> {
    static MAP: OnceLock<HashMap<&'static str, Vec<FieldMapping>>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut m: HashMap<&'static str, Vec<FieldMapping>> = HashMap::new();

        // charge_state
        m.insert("Soc", vec![mapping!("charge_state.usable_battery_level", to_int)]);
        m.insert("BatteryLevel", vec![mapping!("charge_state.battery_level", to_int)]);
        m.insert("ChargeState", vec![mapping!("charge_state.charging_state", to_str)]);
        m.insert("DetailedChargeState", vec![mapping!("charge_state.charge_port_latch", to_str)]);
        m.insert("EstBatteryRange", vec![mapping!("charge_state.est_battery_range", to_float)]);
        m.insert("IdealBatteryRange", vec![mapping!("charge_state.ideal_battery_range", to_float)]);
        m.insert("RatedRange", vec![mapping!("charge_state.battery_range", to_float)]);
        m.insert("ChargerVoltage", vec![mapping!("charge_state.charger_voltage", to_int)]);
        m.insert("ChargeAmps", vec![mapping!("charge_state.charge_amps", to_int)]);
        m.insert("ChargerPhases", vec![mapping!("charge_state.charger_phases", to_int)]);
        m.insert("ChargeLimitSoc", vec![mapping!("charge_state.charge_limit_soc", to_int)]);
        m.insert("ChargeCurrentRequest", vec![mapping!("charge_state.charge_current_request", to_int)]);
        m.insert("ChargeCurrentRequestMax", vec![mapping!("charge_state.charge_current_request_max", to_int)]);
        m.insert("ChargePortDoorOpen", vec![mapping!("charge_state.charge_port_door_open", to_bool)]);
        m.insert("ChargePortLatch", vec![mapping!("charge_state.charge_port_latch", to_str)]);
        m.insert("TimeToFullCharge", vec![mapping!("charge_state.time_to_full_charge", to_float)]);
        m.insert("ACChargingPower", vec![mapping!("charge_state.charger_power", to_float)]);
        m.insert("ACChargingEnergyIn", vec![mapping!("charge_state.charge_energy_added", to_float)]);
        m.insert("FastChargerPresent", vec![mapping!("charge_state.fast_charger_present", to_bool)]);
        m.insert("ScheduledChargingMode", vec![mapping!("charge_state.scheduled_charging_mode", to_str)]);
        m.insert("ScheduledChargingPending", vec![mapping!("charge_state.scheduled_charging_pending", to_bool)]);
        m.insert("ScheduledChargingStartTime", vec![mapping!("charge_state.scheduled_charging_start_time", to_float)]);
        m.insert("ScheduledDepartureTime", vec![mapping!("charge_state.scheduled_departure_time_minutes", to_int)]);
        m.insert("EnergyRemaining", vec![mapping!("charge_state.energy_remaining", to_float)]);
        m.insert("PackVoltage", vec![mapping!("charge_state.pack_voltage", to_float)]);
        m.insert("PackCurrent", vec![mapping!("charge_state.pack_current", to_float)]);
        m.insert("ChargingCableType", vec![mapping!("charge_state.conn_charge_cable", to_str)]);

        // climate_state
        m.insert("InsideTemp", vec![mapping!("climate_state.inside_temp", to_float)]);
        m.insert("OutsideTemp", vec![mapping!("climate_state.outside_temp", to_float)]);
        m.insert("HvacLeftTemperatureRequest", vec![mapping!("climate_state.driver_temp_setting", to_float)]);
        m.insert("HvacRightTemperatureRequest", vec![mapping!("climate_state.passenger_temp_setting", to_float)]);
        m.insert("HvacPower", vec![mapping!("climate_state.is_climate_on", to_bool)]);
        m.insert("HvacFanStatus", vec![mapping!("climate_state.fan_status", to_int)]);
        m.insert("SeatHeaterLeft", vec![mapping!("climate_state.seat_heater_left", to_int)]);
        m.insert("SeatHeaterRight", vec![mapping!("climate_state.seat_heater_right", to_int)]);
        m.insert("SeatHeaterRearLeft", vec![mapping!("climate_state.seat_heater_rear_left", to_int)]);
        m.insert("SeatHeaterRearCenter", vec![mapping!("climate_state.seat_heater_rear_center", to_int)]);
        m.insert("SeatHeaterRearRight", vec![mapping!("climate_state.seat_heater_rear_right", to_int)]);
        m.insert("HvacSteeringWheelHeatLevel", vec![mapping!("climate_state.steering_wheel_heater", to_bool)]);
        m.insert("DefrostMode", vec![mapping!("climate_state.defrost_mode", to_int)]);
        m.insert("CabinOverheatProtectionMode", vec![mapping!("climate_state.cabin_overheat_protection", to_str)]);
        m.insert("PreconditioningEnabled", vec![mapping!("climate_state.is_preconditioning", to_bool)]);

        // drive_state
        m.insert(
            "Location",
            vec![
                mapping!("drive_state.latitude", extract_lat),
                mapping!("drive_state.longitude", extract_lon),
            ],
        );
        m.insert("VehicleSpeed", vec![mapping!("drive_state.speed", to_int)]);
        m.insert("GpsHeading", vec![mapping!("drive_state.heading", to_int)]);
        m.insert("Gear", vec![mapping!("drive_state.shift_state", gear_str)]);

        // vehicle_state
        m.insert("Locked", vec![mapping!("vehicle_state.locked", to_bool)]);
        m.insert("SentryMode", vec![mapping!("vehicle_state.sentry_mode", to_bool)]);
        m.insert("Odometer", vec![mapping!("vehicle_state.odometer", to_float)]);
        m.insert("Version", vec![mapping!("vehicle_state.car_version", to_str)]);
        m.insert("ValetModeEnabled", vec![mapping!("vehicle_state.valet_mode", to_bool)]);
        m.insert("TpmsPressureFl", vec![mapping!("vehicle_state.tpms_pressure_fl", to_float)]);
        m.insert("TpmsPressureFr", vec![mapping!("vehicle_state.tpms_pressure_fr", to_float)]);
        m.insert("TpmsPressureRl", vec![mapping!("vehicle_state.tpms_pressure_rl", to_float)]);
        m.insert("TpmsPressureRr", vec![mapping!("vehicle_state.tpms_pressure_rr", to_float)]);
        m.insert("CenterDisplay", vec![mapping!("vehicle_state.center_display_state", to_int)]);
        m.insert("HomelinkNearby", vec![mapping!("vehicle_state.homelink_nearby", to_bool)]);
        m.insert("DriverSeatOccupied", vec![mapping!("vehicle_state.is_user_present", to_bool)]);
        m.insert("RemoteStartEnabled", vec![mapping!("vehicle_state.remote_start", to_bool)]);

        m
    })
}

/// Stateless mapper from telemetry field names to snapshot paths.
#[derive(Debug, Default, Clone)]
pub struct TelemetryMapper;

impl TelemetryMapper {
    pub fn new() -> Self {
        Self
    }

    /// Map a field to zero or more `(path, value)` pairs.
    ///
    /// Unmapped fields and transforms that return `None` yield nothing.
    pub fn map(&self, field_name: &str, value: &TelemetryValue) -> Vec<(&'static str, Value)> {
        let Some(mappings) = field_map().get(field_name) else {
            return Vec::new();
        };

        mappings
            .iter()
            .filter_map(|m| (m.transform)(value).map(|v| (m.path, v)))
            .collect()
    }

    /// Field names that have at least one mapping.
    pub fn mapped_fields(&self) -> Vec<&'static str> {
        field_map().keys().copied().collect()
    }
}

//! Transform telemetry datums into outbound gateway event envelopes.
//!
//! Each recognized field maps to a labeled event type:
//!
//! - `Location`            → `location`   {latitude, longitude}
//! - `Soc` / `BatteryLevel`→ `battery`    {battery_level}
//! - `EstBatteryRange`     → `battery`    {range_miles}
//! - `InsideTemp`          → `inside_temp`  {inside_temp_f}
//! - `OutsideTemp`         → `outside_temp` {outside_temp_f}
//! - `VehicleSpeed`        → `speed`      {speed_mph}
//! - `ChargeState` / `DetailedChargeState` → charge_* by substring
//! - `Locked` / `SentryMode` → `security_changed`
//! - `Gear`                → `gear_changed`
//!
//! Temperatures are reported in Fahrenheit even though the wire value is
//! Celsius. Unmapped fields yield no event.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::telemetry::decoder::TelemetryValue;

fn celsius_to_fahrenheit(c: f64) -> f64 {
    c * 9.0 / 5.0 + 32.0
}

/// Stateless transformer: telemetry datum → `req:agent` event payload.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    client_id: String,
}

impl EventEmitter {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
        }
    }

    /// Convert a single datum to an event envelope, or `None` when the
    /// field has no event mapping.
    pub fn to_event(
        &self,
        field_name: &str,
        value: &TelemetryValue,
        vin: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<Value> {
        let (event_type, data) = self.build_payload(field_name, value)?;

        Some(json!({
            "method": "req:agent",
            "params": {
                "event_type": event_type,
                "source": self.client_id,
                "vin": vin,
                "timestamp": timestamp.to_rfc3339(),
                "data": data,
            }
        }))
    }

    fn build_payload(&self, field_name: &str, value: &TelemetryValue) -> Option<(String, Value)> {
        match field_name {
            "Location" => {
                let (latitude, longitude) = value.as_location()?;
                Some((
                    "location".to_string(),
                    json!({"latitude": latitude, "longitude": longitude}),
                ))
            }
            "Soc" | "BatteryLevel" => {
                let level = value.as_f64()?;
                Some(("battery".to_string(), json!({"battery_level": level})))
            }
            "EstBatteryRange" => {
                let range = value.as_f64()?;
                Some(("battery".to_string(), json!({"range_miles": range})))
            }
            "InsideTemp" | "OutsideTemp" => {
                let celsius = value.as_f64()?;
                let fahrenheit = (celsius_to_fahrenheit(celsius) * 10.0).round() / 10.0;
                let event_type = if field_name == "InsideTemp" {
                    "inside_temp"
                } else {
                    "outside_temp"
                };
                let mut data = serde_json::Map::new();
                data.insert(format!("{event_type}_f"), json!(fahrenheit));
                Some((event_type.to_string(), Value::Object(data)))
            }
            "VehicleSpeed" => {
                let speed = value.as_f64()?;
                Some(("speed".to_string(), json!({"speed_mph": speed})))
            }
            "ChargeState" | "DetailedChargeState" => {
                let state = value.to_string();
                let lowered = state.to_lowercase();
                let event_type = if lowered.contains("charging") || lowered == "starting" {
                    "charge_started"
                } else if lowered.contains("complete") {
                    "charge_complete"
                } else if lowered.contains("stopped") || lowered.contains("disconnected") {
                    "charge_stopped"
                } else {
                    "charge_state_changed"
                };
                Some((event_type.to_string(), json!({"state": state})))
            }
            "Locked" | "SentryMode" => Some((
                "security_changed".to_string(),
                json!({
                    "field": field_name.to_lowercase(),
                    "value": value.to_json(),
                }),
            )),
            "Gear" => Some((
                "gear_changed".to_string(),
                json!({"gear": value.to_string()}),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter() -> EventEmitter {
        EventEmitter::new("node-host")
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = emitter()
            .to_event("Soc", &TelemetryValue::Int(72), "V1", Utc::now())
            .unwrap();
        assert_eq!(event["method"], "req:agent");
        assert_eq!(event["params"]["event_type"], "battery");
        assert_eq!(event["params"]["source"], "node-host");
        assert_eq!(event["params"]["vin"], "V1");
        assert_eq!(event["params"]["data"]["battery_level"], 72.0);
    }

    #[test]
    fn test_temperature_reported_in_fahrenheit() {
        let event = emitter()
            .to_event("InsideTemp", &TelemetryValue::Float(20.0), "V1", Utc::now())
            .unwrap();
        assert_eq!(event["params"]["event_type"], "inside_temp");
        assert_eq!(event["params"]["data"]["inside_temp_f"], 68.0);
    }

    #[test]
    fn test_charge_state_bucketing() {
        let e = emitter();
        let cases = [
            ("Charging", "charge_started"),
            ("Starting", "charge_started"),
            ("Complete", "charge_complete"),
            ("Stopped", "charge_stopped"),
            ("Disconnected", "charge_stopped"),
            ("NoPower", "charge_state_changed"),
        ];
        for (state, expected) in cases {
            let event = e
                .to_event(
                    "ChargeState",
                    &TelemetryValue::Text(state.to_string()),
                    "V1",
                    Utc::now(),
                )
                .unwrap();
            assert_eq!(event["params"]["event_type"], expected, "state {state}");
            assert_eq!(event["params"]["data"]["state"], state);
        }
    }

    #[test]
    fn test_location_event() {
        let event = emitter()
            .to_event(
                "Location",
                &TelemetryValue::Location {
                    latitude: 37.77,
                    longitude: -122.42,
                },
                "V1",
                Utc::now(),
            )
            .unwrap();
        assert_eq!(event["params"]["event_type"], "location");
        assert_eq!(event["params"]["data"]["latitude"], 37.77);
    }

    #[test]
    fn test_security_changed() {
        let event = emitter()
            .to_event("SentryMode", &TelemetryValue::Bool(true), "V1", Utc::now())
            .unwrap();
        assert_eq!(event["params"]["event_type"], "security_changed");
        assert_eq!(event["params"]["data"]["field"], "sentrymode");
        assert_eq!(event["params"]["data"]["value"], true);
    }

    #[test]
    fn test_unmapped_field_yields_none() {
        assert!(emitter()
            .to_event("PackVoltage", &TelemetryValue::Float(400.0), "V1", Utc::now())
            .is_none());
    }

    #[test]
    fn test_location_value_on_battery_field_yields_none() {
        let loc = TelemetryValue::Location {
            latitude: 0.0,
            longitude: 0.0,
        };
        assert!(emitter().to_event("Soc", &loc, "V1", Utc::now()).is_none());
    }
}

//! Vehicle-scoped Fleet API operations.

use serde_json::{json, Value};

use crate::error::ApiError;
use crate::telemetry::fields::FieldConfig;

use super::client::FleetClient;

/// Result of a vehicle command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub result: bool,
    pub reason: String,
}

/// Vehicle API built on [`FleetClient`].
pub struct VehicleApi<'a> {
    client: &'a FleetClient,
}

impl<'a> VehicleApi<'a> {
    pub fn new(client: &'a FleetClient) -> Self {
        Self { client }
    }

    /// All vehicles on the account.
    pub async fn list_vehicles(&self) -> Result<Vec<Value>, ApiError> {
        let data = self.client.get("/api/1/vehicles").await?;
        match data.get("response") {
            Some(Value::Array(vehicles)) => Ok(vehicles.clone()),
            _ => Ok(Vec::new()),
        }
    }

    /// Full vehicle data, optionally filtered to specific endpoints.
    pub async fn get_vehicle_data(
        &self,
        vin: &str,
        endpoints: Option<&[String]>,
    ) -> Result<Value, ApiError> {
        let path = format!("/api/1/vehicles/{vin}/vehicle_data");
        let data = match endpoints {
            Some(eps) if !eps.is_empty() => {
                self.client
                    .get_with_query(&path, &[("endpoints", eps.join(";"))])
                    .await?
            }
            _ => self.client.get(&path).await?,
        };
        data.get("response")
            .cloned()
            .ok_or_else(|| ApiError::Decode("missing response field".to_string()))
    }

    /// Send a wake-up and return the reported vehicle state.
    pub async fn wake(&self, vin: &str) -> Result<Value, ApiError> {
        let data = self
            .client
            .post(&format!("/api/1/vehicles/{vin}/wake_up"), None)
            .await?;
        data.get("response")
            .cloned()
            .ok_or_else(|| ApiError::Decode("missing response field".to_string()))
    }

    /// Execute a vehicle command. The body already carries the signature
    /// object when the command requires signing.
    pub async fn command(
        &self,
        vin: &str,
        command_name: &str,
        body: Option<Value>,
    ) -> Result<CommandResult, ApiError> {
        let data = self
            .client
            .post(&format!("/api/1/vehicles/{vin}/command/{command_name}"), body)
            .await?;
        let response = data.get("response").cloned().unwrap_or(Value::Null);
        Ok(CommandResult {
            result: response
                .get("result")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            reason: response
                .get("reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
                .unwrap_or("ok")
                .to_string(),
        })
    }

    /// Push a signed fleet telemetry configuration for `vins`.
    pub async fn fleet_telemetry_config_create(
        &self,
        vins: &[String],
        jws_token: &str,
    ) -> Result<Value, ApiError> {
        self.client
            .post(
                "/api/1/vehicles/fleet_telemetry_config_jws",
                Some(json!({"vins": vins, "token": jws_token})),
            )
            .await
    }

    /// Remove the fleet telemetry configuration for `vin`.
    pub async fn fleet_telemetry_config_delete(&self, vin: &str) -> Result<Value, ApiError> {
        self.client
            .delete(&format!("/api/1/vehicles/{vin}/fleet_telemetry_config"))
            .await
    }
}

/// Build the inner fleet-telemetry configuration document.
pub fn build_telemetry_config(hostname: &str, ca_pem: &str, fields: &FieldConfig) -> Value {
    json!({
        "hostname": hostname,
        // The tunnel terminates TLS on 443.
        "port": 443,
        "ca": ca_pem,
        "fields": fields,
        "alert_types": ["service"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::fields::resolve_fields;

    #[test]
    fn test_build_telemetry_config_shape() {
        let fields = resolve_fields("Soc", Some(7)).unwrap();
        let config = build_telemetry_config("host.ts.example", "PEM", &fields);
        assert_eq!(config["hostname"], "host.ts.example");
        assert_eq!(config["port"], 443);
        assert_eq!(config["ca"], "PEM");
        assert_eq!(config["fields"]["Soc"]["interval_seconds"], 7);
        assert_eq!(config["alert_types"][0], "service");
    }
}

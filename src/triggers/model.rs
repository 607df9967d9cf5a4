//! Trigger data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TriggerError;

/// Comparison operators a trigger condition can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerOperator {
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
    Neq,
    Changed,
    Enter,
    Leave,
}

impl TriggerOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lt" => Some(Self::Lt),
            "gt" => Some(Self::Gt),
            "lte" => Some(Self::Lte),
            "gte" => Some(Self::Gte),
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "changed" => Some(Self::Changed),
            "enter" => Some(Self::Enter),
            "leave" => Some(Self::Leave),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Lte => "lte",
            Self::Gte => "gte",
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Changed => "changed",
            Self::Enter => "enter",
            Self::Leave => "leave",
        }
    }

    pub fn is_geofence(&self) -> bool {
        matches!(self, Self::Enter | Self::Leave)
    }
}

/// A single condition a trigger evaluates.
///
/// For numeric operators `value` is a number; for `changed` it is absent;
/// for `enter`/`leave` it is `{latitude, longitude, radius_m}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub operator: TriggerOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl TriggerCondition {
    /// Build a condition, validating the value against the operator.
    pub fn new(
        field: impl Into<String>,
        operator: TriggerOperator,
        value: Option<Value>,
    ) -> Result<Self, TriggerError> {
        let condition = Self {
            field: field.into(),
            operator,
            value,
        };
        condition.validate()?;
        Ok(condition)
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        if self.operator.is_geofence() {
            let Some(Value::Object(geo)) = &self.value else {
                return Err(TriggerError::InvalidCondition(format!(
                    "operator '{}' requires an object value with latitude, longitude, radius_m",
                    self.operator.as_str()
                )));
            };
            let missing: Vec<&str> = ["latitude", "longitude", "radius_m"]
                .iter()
                .filter(|k| !geo.contains_key(**k))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(TriggerError::InvalidCondition(format!(
                    "geofence value missing keys: {}",
                    missing.join(", ")
                )));
            }
        } else if self.operator != TriggerOperator::Changed && self.value.is_none() {
            return Err(TriggerError::InvalidCondition(format!(
                "operator '{}' requires a 'value' parameter",
                self.operator.as_str()
            )));
        }
        Ok(())
    }

    /// Geofence parameters when this is an enter/leave condition.
    pub fn geofence(&self) -> Option<(f64, f64, f64)> {
        let geo = self.value.as_ref()?.as_object()?;
        Some((
            geo.get("latitude")?.as_f64()?,
            geo.get("longitude")?.as_f64()?,
            geo.get("radius_m")?.as_f64()?,
        ))
    }
}

/// Generate a short opaque trigger id (12 hex chars from a UUID v4).
fn make_trigger_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// A registered trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    pub id: String,
    pub condition: TriggerCondition,
    pub once: bool,
    pub cooldown_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl TriggerDefinition {
    pub fn new(condition: TriggerCondition, once: bool, cooldown_seconds: f64) -> Self {
        Self {
            id: make_trigger_id(),
            condition,
            once,
            cooldown_seconds: cooldown_seconds.max(0.0),
            created_at: Utc::now(),
        }
    }
}

/// Notification emitted when a trigger fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerNotification {
    pub trigger_id: String,
    pub field: String,
    pub operator: TriggerOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<Value>,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    pub fired_at: DateTime<Utc>,
    pub vin: String,
}

//! Telemetry triggers: agent-registered conditions evaluated on every
//! decoded datum, with cooldown, one-shot, and geofence semantics.

mod manager;
mod model;

pub use manager::{TriggerManager, MAX_PENDING, MAX_TRIGGERS};
pub use model::{
    TriggerCondition, TriggerDefinition, TriggerNotification, TriggerOperator,
};

//! Trigger evaluation engine.
//!
//! Evaluates registered triggers against incoming telemetry values,
//! enforces cooldowns, queues notifications, and fires callbacks. All
//! mutations happen on the event loop; the interior mutex exists so the
//! manager can be shared behind an `Arc` across sinks and tool handlers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::TriggerError;
use crate::telemetry::decoder::TelemetryValue;

use super::model::{TriggerCondition, TriggerDefinition, TriggerNotification, TriggerOperator};

/// Hard cap on registered triggers.
pub const MAX_TRIGGERS: usize = 100;

/// Bounded pending-notification queue; oldest entries are discarded.
pub const MAX_PENDING: usize = 500;

type OnFireCallback =
    std::sync::Arc<dyn Fn(TriggerNotification) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Inner {
    triggers: HashMap<String, TriggerDefinition>,
    field_index: HashMap<String, HashSet<String>>,
    last_fire_times: HashMap<String, Instant>,
    pending: VecDeque<TriggerNotification>,
    /// One-shot triggers that fired via immediate evaluation and await
    /// confirmed delivery before deletion.
    fired_once: HashSet<String>,
}

/// Registered triggers plus the machinery to evaluate and deliver them.
pub struct TriggerManager {
    vin: String,
    inner: Mutex<Inner>,
    callbacks: Mutex<Vec<OnFireCallback>>,
}

impl TriggerManager {
    pub fn new(vin: impl Into<String>) -> Self {
        Self {
            vin: vin.into(),
            inner: Mutex::new(Inner {
                triggers: HashMap::new(),
                field_index: HashMap::new(),
                last_fire_times: HashMap::new(),
                pending: VecDeque::new(),
                fired_once: HashSet::new(),
            }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a trigger. Fails when the cap is reached.
    pub fn create(&self, trigger: TriggerDefinition) -> Result<TriggerDefinition, TriggerError> {
        trigger.condition.validate()?;
        let mut inner = lock(&self.inner);
        if inner.triggers.len() >= MAX_TRIGGERS {
            return Err(TriggerError::LimitReached(MAX_TRIGGERS));
        }

        inner
            .field_index
            .entry(trigger.condition.field.clone())
            .or_default()
            .insert(trigger.id.clone());
        inner.triggers.insert(trigger.id.clone(), trigger.clone());

        tracing::info!(
            id = %trigger.id,
            field = %trigger.condition.field,
            operator = trigger.condition.operator.as_str(),
            "created trigger"
        );
        Ok(trigger)
    }

    /// Remove a trigger by id. Idempotent; returns whether it existed.
    pub fn delete(&self, trigger_id: &str) -> bool {
        let mut inner = lock(&self.inner);
        delete_locked(&mut inner, trigger_id)
    }

    /// All registered triggers.
    pub fn list_all(&self) -> Vec<TriggerDefinition> {
        lock(&self.inner).triggers.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        lock(&self.inner).triggers.len()
    }

    /// Atomically return and clear the pending notifications.
    pub fn drain_pending(&self) -> Vec<TriggerNotification> {
        let mut inner = lock(&self.inner);
        inner.pending.drain(..).collect()
    }

    /// Register an async callback invoked on every fire.
    pub fn add_on_fire(&self, callback: OnFireCallback) {
        lock(&self.callbacks).push(callback);
    }

    /// Mark a one-shot trigger as fired without deleting it yet; the
    /// delivery callback finalizes it via [`finalize_once`].
    ///
    /// [`finalize_once`]: Self::finalize_once
    pub fn mark_fired_once(&self, trigger_id: &str) {
        lock(&self.inner).fired_once.insert(trigger_id.to_string());
    }

    /// Delete a one-shot trigger whose notification was confirmed
    /// delivered. No-op for triggers not marked via `mark_fired_once`.
    pub fn finalize_once(&self, trigger_id: &str) {
        let mut inner = lock(&self.inner);
        if inner.fired_once.remove(trigger_id) {
            delete_locked(&mut inner, trigger_id);
        }
    }

    /// Check a condition against a value outside the evaluation loop
    /// (used for immediate evaluation at creation time).
    pub fn matches(
        condition: &TriggerCondition,
        value: &TelemetryValue,
        previous: Option<&TelemetryValue>,
    ) -> bool {
        matches_condition(condition, value, previous)
    }

    /// Evaluate all triggers registered for `field` against a new value.
    ///
    /// Fires each matching trigger: records the fire time, queues a
    /// notification, invokes every callback (failures are logged so
    /// siblings still run), and deletes one-shot triggers.
    pub async fn evaluate(
        &self,
        field: &str,
        value: &TelemetryValue,
        previous: Option<&TelemetryValue>,
        timestamp: DateTime<Utc>,
    ) {
        let fired: Vec<TriggerNotification> = {
            let mut inner = lock(&self.inner);
            let Some(candidate_ids) = inner.field_index.get(field) else {
                return;
            };
            let candidate_ids: Vec<String> = candidate_ids.iter().cloned().collect();
            let now = Instant::now();
            let mut fired = Vec::new();

            for tid in candidate_ids {
                let Some(trigger) = inner.triggers.get(&tid).cloned() else {
                    continue;
                };

                // Cooldown applies to persistent triggers only.
                if !trigger.once {
                    if let Some(last) = inner.last_fire_times.get(&tid) {
                        if now.duration_since(*last).as_secs_f64() < trigger.cooldown_seconds {
                            continue;
                        }
                    }
                }

                if !matches_condition(&trigger.condition, value, previous) {
                    continue;
                }

                inner.last_fire_times.insert(tid.clone(), now);
                let notification = TriggerNotification {
                    trigger_id: tid.clone(),
                    field: field.to_string(),
                    operator: trigger.condition.operator,
                    threshold: trigger.condition.value.clone(),
                    value: value.to_json(),
                    previous_value: previous.map(TelemetryValue::to_json),
                    fired_at: timestamp,
                    vin: self.vin.clone(),
                };

                tracing::info!(
                    id = %tid,
                    field,
                    operator = trigger.condition.operator.as_str(),
                    "trigger fired"
                );

                if inner.pending.len() >= MAX_PENDING {
                    inner.pending.pop_front();
                }
                inner.pending.push_back(notification.clone());
                fired.push(notification);

                if trigger.once {
                    delete_locked(&mut inner, &tid);
                }
            }
            fired
        };

        if fired.is_empty() {
            return;
        }

        let callbacks: Vec<OnFireCallback> = lock(&self.callbacks).clone();
        for notification in fired {
            for callback in &callbacks {
                if let Err(error) = callback(notification.clone()).await {
                    tracing::warn!(
                        trigger_id = %notification.trigger_id,
                        %error,
                        "trigger fire callback failed"
                    );
                }
            }
        }
    }
}

fn delete_locked(inner: &mut Inner, trigger_id: &str) -> bool {
    let Some(trigger) = inner.triggers.remove(trigger_id) else {
        return false;
    };
    let field = trigger.condition.field;
    if let Some(ids) = inner.field_index.get_mut(&field) {
        ids.remove(trigger_id);
        if ids.is_empty() {
            inner.field_index.remove(&field);
        }
    }
    inner.last_fire_times.remove(trigger_id);
    tracing::info!(id = trigger_id, "deleted trigger");
    true
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn threshold_f64(threshold: &Value) -> Option<f64> {
    match threshold {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Semantic equality between a telemetry value and a JSON threshold:
/// numerics compare as floats, everything else compares structurally.
fn values_equal(value: &TelemetryValue, threshold: &Value) -> bool {
    if let (Some(a), Some(b)) = (value.as_f64(), threshold_f64(threshold)) {
        if matches!(value, TelemetryValue::Int(_) | TelemetryValue::Float(_))
            && threshold.is_number()
        {
            return a == b;
        }
    }
    value.to_json() == *threshold
}

fn matches_condition(
    condition: &TriggerCondition,
    value: &TelemetryValue,
    previous: Option<&TelemetryValue>,
) -> bool {
    use TriggerOperator::*;

    match condition.operator {
        Changed => previous.map_or(true, |prev| prev != value),
        Eq => condition
            .value
            .as_ref()
            .is_some_and(|t| values_equal(value, t)),
        Neq => condition
            .value
            .as_ref()
            .is_some_and(|t| !values_equal(value, t)),
        Enter | Leave => matches_geofence(condition, value, previous),
        Lt | Gt | Lte | Gte => {
            let (Some(v), Some(t)) = (
                value.as_f64(),
                condition.value.as_ref().and_then(threshold_f64),
            ) else {
                tracing::debug!(
                    field = %condition.field,
                    operator = condition.operator.as_str(),
                    "numeric coercion failed; trigger does not fire"
                );
                return false;
            };
            match condition.operator {
                Lt => v < t,
                Gt => v > t,
                Lte => v <= t,
                Gte => v >= t,
                _ => false,
            }
        }
    }
}

/// Geofence crossing: `enter` fires only on an outside→inside transition,
/// `leave` on the dual. A missing previous point never fires.
fn matches_geofence(
    condition: &TriggerCondition,
    value: &TelemetryValue,
    previous: Option<&TelemetryValue>,
) -> bool {
    let Some((center_lat, center_lon, radius)) = condition.geofence() else {
        tracing::warn!(field = %condition.field, "geofence trigger has invalid boundary value");
        return false;
    };
    let Some((cur_lat, cur_lon)) = value.as_location() else {
        return false;
    };
    let Some((prev_lat, prev_lon)) = previous.and_then(TelemetryValue::as_location) else {
        return false;
    };

    let cur_dist = crate::bridge::filter::haversine(cur_lat, cur_lon, center_lat, center_lon);
    let prev_dist = crate::bridge::filter::haversine(prev_lat, prev_lon, center_lat, center_lon);

    match condition.operator {
        TriggerOperator::Enter => cur_dist <= radius && prev_dist > radius,
        TriggerOperator::Leave => cur_dist > radius && prev_dist <= radius,
        _ => false,
    }
}

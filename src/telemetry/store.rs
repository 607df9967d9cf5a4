//! In-memory store of the latest telemetry value per field.
//!
//! Read by the command dispatcher to answer reads without touching the
//! upstream API; written on every decoded frame by the trigger-evaluation
//! sink or the bridge.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::decoder::TelemetryValue;

/// A single field's most recent value.
#[derive(Debug, Clone)]
pub struct FieldSnapshot {
    pub value: TelemetryValue,
    pub timestamp: DateTime<Utc>,
}

/// Latest-value-per-field store, keyed by wire field name.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    data: Mutex<HashMap<String, FieldSnapshot>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite the latest value for `field_name`.
    pub fn update(&self, field_name: &str, value: TelemetryValue, timestamp: DateTime<Utc>) {
        let mut data = lock_poisoned_ok(&self.data);
        data.insert(field_name.to_string(), FieldSnapshot { value, timestamp });
    }

    /// Latest snapshot for `field_name`, if any.
    pub fn get(&self, field_name: &str) -> Option<FieldSnapshot> {
        lock_poisoned_ok(&self.data).get(field_name).cloned()
    }

    /// All current snapshots.
    pub fn get_all(&self) -> HashMap<String, FieldSnapshot> {
        lock_poisoned_ok(&self.data).clone()
    }

    /// Seconds since `field_name` was last updated.
    pub fn age_seconds(&self, field_name: &str) -> Option<i64> {
        self.get(field_name)
            .map(|snap| (Utc::now() - snap.timestamp).num_seconds())
    }
}

fn lock_poisoned_ok<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_and_get() {
        let store = TelemetryStore::new();
        assert!(store.get("Soc").is_none());

        store.update("Soc", TelemetryValue::Int(72), Utc::now());
        let snap = store.get("Soc").unwrap();
        assert_eq!(snap.value, TelemetryValue::Int(72));

        store.update("Soc", TelemetryValue::Int(71), Utc::now());
        assert_eq!(store.get("Soc").unwrap().value, TelemetryValue::Int(71));
    }

    #[test]
    fn test_age_seconds() {
        let store = TelemetryStore::new();
        store.update(
            "Soc",
            TelemetryValue::Int(50),
            Utc::now() - chrono::Duration::seconds(30),
        );
        let age = store.age_seconds("Soc").unwrap();
        assert!((29..=31).contains(&age));
    }
}

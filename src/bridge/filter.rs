//! Dual-gate emission filter.
//!
//! A candidate value passes when every gate passes:
//!
//! 1. **Throttle gate** — at least `throttle_seconds` since the last emit.
//! 2. **Delta gate** — the value moved at least `granularity` from the
//!    last emitted value (great-circle meters for locations, absolute
//!    difference for numerics, any-change when `granularity == 0`).
//! 3. **Staleness override** — with `max_seconds > 0`, a field silent for
//!    longer than that is emitted regardless of delta.

use std::collections::HashMap;
use std::time::Instant;

use crate::telemetry::decoder::TelemetryValue;

use super::config::FieldFilter;

/// Haversine distance in meters between two WGS-84 coordinates.
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
}

/// Delta between two values for gating purposes. Non-comparable values
/// count as infinitely far apart.
fn value_delta(old: &TelemetryValue, new: &TelemetryValue) -> f64 {
    if let (Some((lat1, lon1)), Some((lat2, lon2))) = (old.as_location(), new.as_location()) {
        return haversine(lat1, lon1, lat2, lon2);
    }
    match (old.as_f64(), new.as_f64()) {
        (Some(a), Some(b)) => (b - a).abs(),
        _ => f64::INFINITY,
    }
}

#[derive(Debug, Clone)]
struct EmitState {
    last_value: TelemetryValue,
    last_emit: Instant,
}

/// Per-field delta + throttle + maximum-silence gating.
pub struct DualGateFilter {
    filters: HashMap<String, FieldFilter>,
    state: HashMap<String, EmitState>,
}

impl DualGateFilter {
    pub fn new(filters: HashMap<String, FieldFilter>) -> Self {
        Self {
            filters,
            state: HashMap::new(),
        }
    }

    /// Whether a value passes the gates right `now`.
    ///
    /// Unknown or disabled fields always reject.
    pub fn should_emit(&self, field: &str, value: &TelemetryValue, now: Instant) -> bool {
        let Some(cfg) = self.filters.get(field) else {
            return false;
        };
        if !cfg.enabled {
            return false;
        }

        let Some(prev) = self.state.get(field) else {
            // First value for this field always passes.
            return true;
        };

        let elapsed = now.saturating_duration_since(prev.last_emit).as_secs_f64();

        if cfg.throttle_seconds > 0.0 && elapsed < cfg.throttle_seconds {
            return false;
        }

        if cfg.max_seconds > 0.0 && elapsed > cfg.max_seconds {
            return true;
        }

        if cfg.granularity == 0.0 {
            return *value != prev.last_value;
        }
        value_delta(&prev.last_value, value) >= cfg.granularity
    }

    /// Record an emission (call after `should_emit` returned true).
    pub fn record_emit(&mut self, field: &str, value: &TelemetryValue, now: Instant) {
        self.state.insert(
            field.to_string(),
            EmitState {
                last_value: value.clone(),
                last_emit: now,
            },
        );
    }

    /// Clear all tracked state.
    pub fn reset(&mut self) {
        self.state.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn filter_with(field: &str, cfg: FieldFilter) -> DualGateFilter {
        let mut filters = HashMap::new();
        filters.insert(field.to_string(), cfg);
        DualGateFilter::new(filters)
    }

    #[test]
    fn test_haversine_sanity() {
        // Identity and symmetry.
        assert_eq!(haversine(37.77, -122.42, 37.77, -122.42), 0.0);
        let ab = haversine(37.77, -122.42, 37.78, -122.43);
        let ba = haversine(37.78, -122.43, 37.77, -122.42);
        assert!((ab - ba).abs() < 1e-9);

        // One thousandth of a degree of latitude is ~111 m.
        let d = haversine(37.770, -122.42, 37.771, -122.42);
        assert!((100.0..=120.0).contains(&d), "got {d}");
    }

    #[test]
    fn test_first_value_always_passes() {
        let filt = filter_with("Soc", FieldFilter::new(5.0, 10.0));
        assert!(filt.should_emit("Soc", &TelemetryValue::Int(50), Instant::now()));
    }

    #[test]
    fn test_unknown_and_disabled_fields_reject() {
        let mut cfg = FieldFilter::new(0.0, 0.0);
        cfg.enabled = false;
        let filt = filter_with("Soc", cfg);
        assert!(!filt.should_emit("Soc", &TelemetryValue::Int(50), Instant::now()));
        assert!(!filt.should_emit("Nope", &TelemetryValue::Int(50), Instant::now()));
    }

    #[test]
    fn test_throttle_gate() {
        let mut filt = filter_with("Soc", FieldFilter::new(0.0, 10.0));
        let t0 = Instant::now();
        filt.record_emit("Soc", &TelemetryValue::Int(50), t0);

        // 5s later — throttled even though the value changed.
        assert!(!filt.should_emit("Soc", &TelemetryValue::Int(60), t0 + Duration::from_secs(5)));
        // 11s later — throttle satisfied, delta (any change) passes.
        assert!(filt.should_emit("Soc", &TelemetryValue::Int(60), t0 + Duration::from_secs(11)));
    }

    #[test]
    fn test_delta_gate_granularity() {
        let mut filt = filter_with("Soc", FieldFilter::new(5.0, 0.0));
        let t0 = Instant::now();
        filt.record_emit("Soc", &TelemetryValue::Int(50), t0);

        assert!(!filt.should_emit("Soc", &TelemetryValue::Int(53), t0));
        assert!(filt.should_emit("Soc", &TelemetryValue::Int(55), t0));
    }

    #[test]
    fn test_zero_granularity_means_any_change() {
        let mut filt = filter_with("ChargeState", FieldFilter::new(0.0, 0.0));
        let t0 = Instant::now();
        let charging = TelemetryValue::Text("Charging".to_string());
        filt.record_emit("ChargeState", &charging, t0);

        assert!(!filt.should_emit("ChargeState", &charging, t0));
        assert!(filt.should_emit(
            "ChargeState",
            &TelemetryValue::Text("Complete".to_string()),
            t0
        ));
    }

    #[test]
    fn test_location_delta_uses_meters() {
        let mut filt = filter_with("Location", FieldFilter::new(50.0, 0.0));
        let t0 = Instant::now();
        let origin = TelemetryValue::Location {
            latitude: 37.770,
            longitude: -122.42,
        };
        filt.record_emit("Location", &origin, t0);

        // ~11 m move — below granularity.
        let near = TelemetryValue::Location {
            latitude: 37.7701,
            longitude: -122.42,
        };
        assert!(!filt.should_emit("Location", &near, t0));

        // ~111 m move — passes.
        let far = TelemetryValue::Location {
            latitude: 37.771,
            longitude: -122.42,
        };
        assert!(filt.should_emit("Location", &far, t0));
    }

    #[test]
    fn test_non_numeric_counts_as_infinite_delta() {
        let mut filt = filter_with("Gear", FieldFilter::new(5.0, 0.0));
        let t0 = Instant::now();
        filt.record_emit("Gear", &TelemetryValue::Text("P".to_string()), t0);
        assert!(filt.should_emit("Gear", &TelemetryValue::Text("D".to_string()), t0));
    }

    #[test]
    fn test_staleness_override() {
        let mut cfg = FieldFilter::new(100.0, 0.0);
        cfg.max_seconds = 30.0;
        let mut filt = filter_with("Soc", cfg);
        let t0 = Instant::now();
        filt.record_emit("Soc", &TelemetryValue::Int(50), t0);

        // Tiny delta, under max_seconds — rejected.
        assert!(!filt.should_emit("Soc", &TelemetryValue::Int(51), t0 + Duration::from_secs(10)));
        // Same tiny delta past max_seconds — forced through.
        assert!(filt.should_emit("Soc", &TelemetryValue::Int(51), t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut filt = filter_with("Soc", FieldFilter::new(1000.0, 0.0));
        let t0 = Instant::now();
        filt.record_emit("Soc", &TelemetryValue::Int(50), t0);
        assert!(!filt.should_emit("Soc", &TelemetryValue::Int(51), t0));

        filt.reset();
        assert!(filt.should_emit("Soc", &TelemetryValue::Int(51), t0));
    }
}

//! Cache-warming telemetry sink.
//!
//! Maps each datum into snapshot paths, stages the leaves in a buffer,
//! and merges the buffer into the response cache on a flush interval.
//! While telemetry streams, reads are served from the warmed cache and
//! cost no upstream requests.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::cache::ResponseCache;

use super::decoder::TelemetryFrame;
use super::fanout::FrameSink;
use super::mapper::TelemetryMapper;

/// TTL applied to cache entries while telemetry is streaming.
const TELEMETRY_TTL_SECS: u64 = 120;

/// Minimum interval between cache flushes.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Set a value in a nested JSON object along a dotted path, creating
/// intermediate objects as needed.
pub fn deep_set(target: &mut Map<String, Value>, dotted_path: &str, value: Value) {
    let mut keys = dotted_path.split('.').peekable();
    let mut current = target;
    while let Some(key) = keys.next() {
        if keys.peek().is_none() {
            current.insert(key.to_string(), value);
            return;
        }
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        // The entry was just ensured to be an object.
        #[allow(clippy::unwrap_used)]
        {
            current = entry.as_object_mut().unwrap();
        }
    }
}

/// Recursively merge `overlay` into `base`, right-wins at the leaves.
/// Object values merge recursively; everything else overwrites.
pub fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(base_obj)), Value::Object(overlay_obj)) => {
                deep_merge(base_obj, overlay_obj);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn count_leaves(obj: &Map<String, Value>) -> usize {
    obj.values()
        .map(|v| match v {
            Value::Object(inner) => count_leaves(inner),
            _ => 1,
        })
        .sum()
}

struct SinkState {
    pending: Map<String, Value>,
    last_flush: Option<Instant>,
    frame_count: u64,
    field_count: u64,
}

/// Telemetry sink that warms the response cache.
pub struct CacheSink {
    cache: ResponseCache,
    mapper: TelemetryMapper,
    vin: String,
    flush_interval: Duration,
    telemetry_ttl: u64,
    state: Mutex<SinkState>,
}

impl CacheSink {
    pub fn new(cache: ResponseCache, mapper: TelemetryMapper, vin: impl Into<String>) -> Self {
        Self {
            cache,
            mapper,
            vin: vin.into(),
            flush_interval: FLUSH_INTERVAL,
            telemetry_ttl: TELEMETRY_TTL_SECS,
            state: Mutex::new(SinkState {
                pending: Map::new(),
                last_flush: None,
                frame_count: 0,
                field_count: 0,
            }),
        }
    }

    /// Override the flush interval (tests use zero).
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn frame_count(&self) -> u64 {
        lock(&self.state).frame_count
    }

    pub fn field_count(&self) -> u64 {
        lock(&self.state).field_count
    }

    /// Buffered leaf updates not yet flushed.
    pub fn pending_count(&self) -> usize {
        count_leaves(&lock(&self.state).pending)
    }

    /// Merge buffered updates into the response cache immediately.
    ///
    /// The merge never decreases cached detail: existing leaves not in
    /// the buffer are preserved, intermediate objects are never replaced
    /// wholesale.
    pub fn flush(&self) -> anyhow::Result<()> {
        let pending = {
            let mut state = lock(&self.state);
            if state.pending.is_empty() {
                return Ok(());
            }
            std::mem::take(&mut state.pending)
        };

        let mut blob = match self.cache.get(&self.vin) {
            Some(entry) => match entry.data {
                Value::Object(obj) => obj,
                _ => Map::new(),
            },
            None => {
                let mut fresh = Map::new();
                fresh.insert("vin".to_string(), Value::String(self.vin.clone()));
                fresh.insert("state".to_string(), Value::String("online".to_string()));
                fresh
            }
        };

        deep_merge(&mut blob, &pending);
        self.cache
            .put(&self.vin, Value::Object(blob), Some(self.telemetry_ttl))?;
        self.cache
            .put_wake_state(&self.vin, true, Some(self.telemetry_ttl))?;

        tracing::debug!(vin = %self.vin, "cache sink flushed");
        Ok(())
    }
}

fn lock(state: &Mutex<SinkState>) -> std::sync::MutexGuard<'_, SinkState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl FrameSink for CacheSink {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        if frame.vin != self.vin {
            return Ok(());
        }

        let should_flush = {
            let mut state = lock(&self.state);
            state.frame_count += 1;

            for datum in &frame.data {
                for (path, value) in self.mapper.map(&datum.field_name, &datum.value) {
                    deep_set(&mut state.pending, path, value);
                    state.field_count += 1;
                }
            }

            match state.last_flush {
                Some(last) if last.elapsed() < self.flush_interval => false,
                _ => {
                    state.last_flush = Some(Instant::now());
                    true
                }
            }
        };

        if should_flush {
            self.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::decoder::{TelemetryDatum, TelemetryValue};
    use chrono::Utc;
    use serde_json::json;

    fn frame(vin: &str, data: Vec<(&str, u32, TelemetryValue)>) -> TelemetryFrame {
        TelemetryFrame {
            vin: vin.to_string(),
            created_at: Utc::now(),
            data: data
                .into_iter()
                .map(|(name, id, value)| TelemetryDatum {
                    field_name: name.to_string(),
                    field_id: id,
                    value_type: value.type_name(),
                    value,
                })
                .collect(),
            is_resend: false,
        }
    }

    fn test_cache() -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), 300, true).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_deep_set_creates_intermediates() {
        let mut obj = Map::new();
        deep_set(&mut obj, "charge_state.battery_level", json!(80));
        assert_eq!(obj["charge_state"]["battery_level"], 80);
    }

    #[test]
    fn test_deep_merge_right_wins_at_leaves_only() {
        let mut base = json!({
            "charge_state": {"battery_level": 70, "charging_state": "Charging"}
        });
        let overlay = json!({"charge_state": {"battery_level": 80}});

        let base_obj = base.as_object_mut().unwrap();
        deep_merge(base_obj, overlay.as_object().unwrap());

        assert_eq!(base_obj["charge_state"]["battery_level"], 80);
        assert_eq!(base_obj["charge_state"]["charging_state"], "Charging");
    }

    #[test]
    fn test_deep_merge_commutes_for_disjoint_paths() {
        let a = json!({"charge_state": {"battery_level": 80}});
        let b = json!({"drive_state": {"latitude": 37.77}});
        let base = json!({"vin": "V"});

        let mut ab = base.as_object().unwrap().clone();
        deep_merge(&mut ab, a.as_object().unwrap());
        deep_merge(&mut ab, b.as_object().unwrap());

        let mut ba = base.as_object().unwrap().clone();
        deep_merge(&mut ba, b.as_object().unwrap());
        deep_merge(&mut ba, a.as_object().unwrap());

        assert_eq!(ab, ba);
    }

    #[tokio::test]
    async fn test_warms_cache_from_frames() {
        let (_dir, cache) = test_cache();
        let sink = CacheSink::new(cache.clone(), TelemetryMapper::new(), "V1")
            .with_flush_interval(Duration::ZERO);

        sink.on_frame(&frame(
            "V1",
            vec![
                ("Soc", 8, TelemetryValue::Int(72)),
                (
                    "Location",
                    21,
                    TelemetryValue::Location {
                        latitude: 37.77,
                        longitude: -122.42,
                    },
                ),
            ],
        ))
        .await
        .unwrap();
        sink.flush().unwrap();

        let entry = cache.get("V1").unwrap();
        assert_eq!(entry.data["charge_state"]["usable_battery_level"], 72);
        assert_eq!(entry.data["drive_state"]["latitude"], 37.77);
        assert_eq!(entry.data["drive_state"]["longitude"], -122.42);
        assert!(cache.get_wake_state("V1"));
    }

    #[tokio::test]
    async fn test_skips_other_vins() {
        let (_dir, cache) = test_cache();
        let sink = CacheSink::new(cache.clone(), TelemetryMapper::new(), "V1")
            .with_flush_interval(Duration::ZERO);

        sink.on_frame(&frame("OTHER", vec![("Soc", 8, TelemetryValue::Int(50))]))
            .await
            .unwrap();
        sink.flush().unwrap();

        assert_eq!(sink.frame_count(), 0);
        assert!(cache.get("V1").is_none());
    }

    #[tokio::test]
    async fn test_merge_preserves_existing_detail() {
        let (_dir, cache) = test_cache();
        cache
            .put(
                "V1",
                json!({"vin": "V1", "climate_state": {"inside_temp": 20.0}}),
                None,
            )
            .unwrap();

        let sink = CacheSink::new(cache.clone(), TelemetryMapper::new(), "V1")
            .with_flush_interval(Duration::ZERO);
        sink.on_frame(&frame("V1", vec![("Soc", 8, TelemetryValue::Int(60))]))
            .await
            .unwrap();
        sink.flush().unwrap();

        let entry = cache.get("V1").unwrap();
        assert_eq!(entry.data["climate_state"]["inside_temp"], 20.0);
        assert_eq!(entry.data["charge_state"]["usable_battery_level"], 60);
    }
}

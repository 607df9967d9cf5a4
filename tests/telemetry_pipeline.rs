//! End-to-end telemetry pipeline: binary frames through the decoder and
//! fan-out into the cache-warming and CSV sinks.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetgate::cache::ResponseCache;
use fleetgate::telemetry::cache_sink::CacheSink;
use fleetgate::telemetry::csv_sink::CsvLogSink;
use fleetgate::telemetry::fanout::{FrameFanout, FrameSink};
use fleetgate::telemetry::mapper::TelemetryMapper;
use fleetgate::telemetry::{TelemetryDecoder, TelemetryFrame};

struct Recorder {
    name: &'static str,
    seen: Mutex<Vec<String>>,
    fail_on_frame: Option<usize>,
}

#[async_trait]
impl FrameSink for Recorder {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        let index = {
            let mut seen = self.seen.lock().unwrap();
            seen.push(frame.vin.clone());
            seen.len()
        };
        if self.fail_on_frame == Some(index) {
            anyhow::bail!("sink {} refused frame {index}", self.name);
        }
        Ok(())
    }
}

#[tokio::test]
async fn frames_fan_out_in_order_even_when_one_sink_fails() {
    let decoder = TelemetryDecoder::new();
    let a = Arc::new(Recorder {
        name: "a",
        seen: Mutex::new(vec![]),
        fail_on_frame: None,
    });
    let b = Arc::new(Recorder {
        name: "b",
        seen: Mutex::new(vec![]),
        fail_on_frame: Some(2),
    });
    let c = Arc::new(Recorder {
        name: "c",
        seen: Mutex::new(vec![]),
        fail_on_frame: None,
    });

    let mut fanout = FrameFanout::new();
    fanout.add_sink(a.clone());
    fanout.add_sink(b.clone());
    fanout.add_sink(c.clone());

    for vin in ["F1", "F2", "F3"] {
        let raw = common::payload(vin, &[(8, common::int_value(50))]);
        let frame = decoder.decode(&raw).unwrap();
        fanout.on_frame(&frame).await;
    }

    // Every sink saw every frame, in receive order; b's failure on F2
    // did not disturb a or c.
    for sink in [&a, &b, &c] {
        assert_eq!(*sink.seen.lock().unwrap(), vec!["F1", "F2", "F3"]);
    }
    assert_eq!(fanout.frame_count(), 3);
}

#[tokio::test]
async fn telemetry_warms_the_response_cache() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ResponseCache::open(dir.path(), 300, true).unwrap();
    let sink = Arc::new(
        CacheSink::new(cache.clone(), TelemetryMapper::new(), "5YJ3CACHE")
            .with_flush_interval(std::time::Duration::ZERO),
    );

    let mut fanout = FrameFanout::new();
    fanout.add_sink(sink.clone());

    let raw = common::payload(
        "5YJ3CACHE",
        &[
            (8, common::int_value(72)),
            (21, common::location_value(37.77, -122.42)),
        ],
    );
    let frame = TelemetryDecoder::new().decode(&raw).unwrap();
    fanout.on_frame(&frame).await;
    sink.flush().unwrap();

    let entry = cache.get("5YJ3CACHE").unwrap();
    assert_eq!(entry.data["charge_state"]["usable_battery_level"], 72);
    assert!((entry.data["drive_state"]["latitude"].as_f64().unwrap() - 37.77).abs() < 1e-9);
    assert!((entry.data["drive_state"]["longitude"].as_f64().unwrap() + 122.42).abs() < 1e-9);
    assert!(cache.get_wake_state("5YJ3CACHE"));
}

#[tokio::test]
async fn csv_log_grows_header_across_decoded_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stream.csv");
    let sink = Arc::new(CsvLogSink::new(path.clone(), Some("V1".to_string())));
    let decoder = TelemetryDecoder::new();

    let first = common::payload("V1", &[(8, common::int_value(70))]);
    let second = common::payload(
        "V1",
        &[
            (8, common::int_value(69)),
            (2, common::string_value("Charging")),
        ],
    );
    sink.on_frame(&decoder.decode(&first).unwrap()).await.unwrap();
    sink.on_frame(&decoder.decode(&second).unwrap()).await.unwrap();
    sink.close();

    let content = std::fs::read_to_string(&path).unwrap();
    let mut lines = content.lines();
    assert_eq!(lines.next().unwrap(), "timestamp,vin,Soc,ChargeState");
    assert_eq!(lines.count(), 2);
    assert!(content.contains("Charging"));
}

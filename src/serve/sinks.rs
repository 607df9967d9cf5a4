//! Runtime-owned fanout sinks: JSONL output for piped telemetry-only
//! mode, a log display sink, and the trigger-evaluation sink used when
//! no bridge is active.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::telemetry::decoder::TelemetryFrame;
use crate::telemetry::fanout::FrameSink;
use crate::telemetry::store::TelemetryStore;
use crate::triggers::TriggerManager;

/// Prints one JSON line per frame (telemetry-only piped mode).
pub struct JsonlSink;

#[async_trait]
impl FrameSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        let data: serde_json::Map<String, serde_json::Value> = frame
            .data
            .iter()
            .map(|d| (d.field_name.clone(), d.value.to_json()))
            .collect();
        let line = json!({
            "vin": frame.vin,
            "timestamp": frame.created_at.to_rfc3339(),
            "data": data,
        });
        println!("{line}");
        Ok(())
    }
}

/// Logs a per-frame summary (the interactive display surface).
pub struct DisplaySink;

#[async_trait]
impl FrameSink for DisplaySink {
    fn name(&self) -> &'static str {
        "display"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        tracing::info!(
            vin = %frame.vin,
            fields = frame.data.len(),
            resend = frame.is_resend,
            "telemetry frame"
        );
        Ok(())
    }
}

/// Evaluates triggers per datum, capturing the previous value from the
/// store before updating it.
///
/// Registered only when the bridge is inactive — the bridge evaluates
/// triggers itself, and double evaluation would double-fire.
pub struct TriggerEvalSink {
    store: Arc<TelemetryStore>,
    triggers: Arc<TriggerManager>,
}

impl TriggerEvalSink {
    pub fn new(store: Arc<TelemetryStore>, triggers: Arc<TriggerManager>) -> Self {
        Self { store, triggers }
    }
}

#[async_trait]
impl FrameSink for TriggerEvalSink {
    fn name(&self) -> &'static str {
        "trigger-eval"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        for datum in &frame.data {
            let previous = self.store.get(&datum.field_name).map(|snap| snap.value);
            self.store
                .update(&datum.field_name, datum.value.clone(), frame.created_at);
            self.triggers
                .evaluate(
                    &datum.field_name,
                    &datum.value,
                    previous.as_ref(),
                    frame.created_at,
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::decoder::{TelemetryDatum, TelemetryValue};
    use crate::triggers::{TriggerCondition, TriggerDefinition, TriggerOperator};
    use chrono::Utc;

    fn soc_frame(value: i64) -> TelemetryFrame {
        TelemetryFrame {
            vin: "V1".to_string(),
            created_at: Utc::now(),
            data: vec![TelemetryDatum {
                field_name: "Soc".to_string(),
                field_id: 8,
                value: TelemetryValue::Int(value),
                value_type: "int",
            }],
            is_resend: false,
        }
    }

    #[tokio::test]
    async fn test_trigger_sink_supplies_previous_value() {
        let store = Arc::new(TelemetryStore::new());
        let triggers = Arc::new(TriggerManager::new("V1"));
        triggers
            .create(TriggerDefinition::new(
                TriggerCondition::new("Soc", TriggerOperator::Changed, None).unwrap(),
                false,
                0.0,
            ))
            .unwrap();
        let sink = TriggerEvalSink::new(store.clone(), triggers.clone());

        sink.on_frame(&soc_frame(50)).await.unwrap();
        sink.on_frame(&soc_frame(50)).await.unwrap();
        sink.on_frame(&soc_frame(55)).await.unwrap();

        // First frame fires (no previous), second is unchanged, third fires.
        let pending = triggers.drain_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].previous_value, Some(serde_json::json!(50)));
        assert_eq!(store.get("Soc").unwrap().value, TelemetryValue::Int(55));
    }
}

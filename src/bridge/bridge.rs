//! Telemetry bridge: decoder → filter → emitter → gateway.
//!
//! Runs as a fanout sink. For each datum the bridge updates the shared
//! telemetry store, evaluates triggers (capturing the previous value),
//! then pushes the datum through the dual-gate filter and the event
//! emitter, and finally sends the event to the gateway — or prints it as
//! JSONL in dry-run mode. Nothing in this pipeline may kill the frame
//! loop: sends are best-effort and rejections only bump the drop count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crate::telemetry::decoder::TelemetryFrame;
use crate::telemetry::fanout::FrameSink;
use crate::telemetry::store::TelemetryStore;
use crate::triggers::{TriggerManager, TriggerNotification};

use super::emitter::EventEmitter;
use super::filter::DualGateFilter;
use super::gateway::GatewayClient;

/// Frame pipeline feeding the operator gateway.
pub struct TelemetryBridge {
    gateway: Arc<tokio::sync::Mutex<GatewayClient>>,
    filter: Mutex<DualGateFilter>,
    emitter: EventEmitter,
    dry_run: bool,
    client_id: String,
    store: Arc<TelemetryStore>,
    triggers: Arc<TriggerManager>,
    event_count: AtomicU64,
    drop_count: AtomicU64,
}

impl TelemetryBridge {
    pub fn new(
        gateway: Arc<tokio::sync::Mutex<GatewayClient>>,
        filter: DualGateFilter,
        emitter: EventEmitter,
        store: Arc<TelemetryStore>,
        triggers: Arc<TriggerManager>,
        client_id: impl Into<String>,
        dry_run: bool,
    ) -> Self {
        Self {
            gateway,
            filter: Mutex::new(filter),
            emitter,
            dry_run,
            client_id: client_id.into(),
            store,
            triggers,
            event_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    pub fn gateway(&self) -> Arc<tokio::sync::Mutex<GatewayClient>> {
        self.gateway.clone()
    }

    pub fn telemetry_store(&self) -> Arc<TelemetryStore> {
        self.store.clone()
    }

    async fn deliver(&self, event: &serde_json::Value) -> bool {
        if self.dry_run {
            // Dry-run prints events as JSONL instead of sending.
            println!("{event}");
            return true;
        }
        self.gateway.lock().await.send_event(event).await
    }

    fn lifecycle_event(&self, event_type: &str) -> serde_json::Value {
        json!({
            "method": "req:agent",
            "params": {
                "event_type": event_type,
                "source": self.client_id,
                "timestamp": Utc::now().to_rfc3339(),
                "data": {},
            }
        })
    }

    /// Announce the bridge to the gateway. Best-effort.
    pub async fn send_connected(&self) -> bool {
        self.deliver(&self.lifecycle_event("node.connected")).await
    }

    /// Tell the gateway we are going away. Best-effort.
    pub async fn send_disconnecting(&self) -> bool {
        self.deliver(&self.lifecycle_event("node.disconnecting")).await
    }

    /// Build the on-fire callback that pushes trigger notifications to
    /// the gateway as `trigger.fired` events.
    ///
    /// On confirmed delivery the callback finalizes one-shot triggers
    /// that were held open for delivery (`mark_fired_once`).
    pub fn make_trigger_push_callback(
        self: &Arc<Self>,
    ) -> std::sync::Arc<
        dyn Fn(TriggerNotification) -> futures::future::BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync,
    > {
        let bridge = Arc::clone(self);
        std::sync::Arc::new(move |notification: TriggerNotification| {
            let bridge = Arc::clone(&bridge);
            Box::pin(async move {
                let event = json!({
                    "method": "req:agent",
                    "params": {
                        "event_type": "trigger.fired",
                        "source": bridge.client_id,
                        "vin": notification.vin,
                        "timestamp": notification.fired_at.to_rfc3339(),
                        "data": serde_json::to_value(&notification)?,
                    }
                });
                if bridge.deliver(&event).await {
                    bridge.triggers.finalize_once(&notification.trigger_id);
                }
                Ok(())
            })
        })
    }
}

#[async_trait]
impl FrameSink for TelemetryBridge {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()> {
        let now = Instant::now();

        for datum in &frame.data {
            // Capture the previous value, update the store, then evaluate
            // triggers — the bridge owns trigger evaluation when active.
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

            // Gate check and emit-state update are atomic per field:
            // one lock scope, no await inside.
            let event = {
                let mut filter = match self.filter.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if !filter.should_emit(&datum.field_name, &datum.value, now) {
                    self.drop_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let Some(event) = self.emitter.to_event(
                    &datum.field_name,
                    &datum.value,
                    &frame.vin,
                    frame.created_at,
                ) else {
                    self.drop_count.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                filter.record_emit(&datum.field_name, &datum.value, now);
                event
            };

            self.event_count.fetch_add(1, Ordering::Relaxed);
            self.deliver(&event).await;
        }
        Ok(())
    }
}

//! Frame fan-out dispatcher.
//!
//! Delivers each decoded frame to every registered sink, sequentially and
//! in registration order, so sinks observe frames in receive order. A
//! failing sink is logged and the remaining sinks still get the frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::decoder::TelemetryFrame;

/// A consumer of decoded telemetry frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Short name used in failure logs.
    fn name(&self) -> &'static str;

    /// Handle one frame. Errors are contained by the fanout.
    async fn on_frame(&self, frame: &TelemetryFrame) -> anyhow::Result<()>;
}

/// Fan-out dispatcher over a fixed set of sinks.
#[derive(Default)]
pub struct FrameFanout {
    sinks: Vec<Arc<dyn FrameSink>>,
    frame_count: AtomicU64,
}

impl FrameFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Sinks receive frames in registration order.
    pub fn add_sink(&mut self, sink: Arc<dyn FrameSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Total frames dispatched (advances even when a sink fails).
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Dispatch `frame` to every sink.
    pub async fn on_frame(&self, frame: &TelemetryFrame) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            if let Err(error) = sink.on_frame(frame).await {
                tracing::warn!(sink = sink.name(), %error, "sink failed for frame");
            }
        }
    }
}

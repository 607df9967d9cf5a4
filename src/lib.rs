//! fleetgate: personal command, telemetry, and automation gateway for a
//! cloud vehicle fleet API.
//!
//! ## Architecture
//!
//! - **Telemetry**: binary frame decoder, field registry, snapshot
//!   mapper, and a fan-out dispatcher feeding sinks (cache warmer, CSV
//!   log, trigger evaluation, outbound bridge).
//! - **Tool surface**: an OAuth-protected JSON-RPC-over-HTTP server that
//!   forwards tool calls into the CLI dispatcher.
//! - **Bridge**: dual-gate filtering, event emission, and a reconnecting
//!   WebSocket client toward an operator gateway.
//! - **Serve runtime**: everything above on one event loop behind one
//!   public tunnel, with ordered startup and shutdown.

pub mod api;
pub mod bridge;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod mcp;
pub mod output;
pub mod protocol;
pub mod serve;
pub mod telemetry;
pub mod triggers;
pub mod tunnel;

pub use cache::ResponseCache;
pub use config::Settings;
pub use telemetry::{FrameFanout, TelemetryDecoder, TelemetryFrame, TelemetryStore};
pub use triggers::TriggerManager;

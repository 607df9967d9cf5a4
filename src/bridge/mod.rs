//! Outbound gateway bridge: per-field filtering, event transformation,
//! the WebSocket gateway client, the frame pipeline, and the command
//! dispatcher for inbound tool invocations.

pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod emitter;
pub mod filter;
pub mod gateway;

pub use bridge::TelemetryBridge;
pub use config::{BridgeConfig, FieldFilter};
pub use dispatcher::CommandDispatcher;
pub use emitter::EventEmitter;
pub use filter::DualGateFilter;
pub use gateway::GatewayClient;

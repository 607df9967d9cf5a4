//! Telemetry ingestion: wire decoding, field registry, mapping, fan-out,
//! and the sinks that consume decoded frames.

pub mod cache_sink;
pub mod csv_sink;
pub mod decoder;
pub mod fanout;
pub mod fields;
pub mod mapper;
pub mod session;
pub mod store;

pub use decoder::{TelemetryDatum, TelemetryDecoder, TelemetryFrame, TelemetryValue};
pub use fanout::{FrameFanout, FrameSink};
pub use store::TelemetryStore;

//! Binary telemetry frame decoder.
//!
//! Parses the provider's protobuf-encoded `Payload` messages with a
//! hand-rolled wire reader — no vendored `.proto` files.
//!
//! Wire format (from the provider's fleet-telemetry proto):
//!
//! ```text
//! message Payload {
//!   repeated Datum data = 1;
//!   Timestamp created_at = 2;   // {seconds = 1, nanos = 2}
//!   string vin = 3;
//!   bool is_resend = 4;
//! }
//! message Datum {
//!   Field key = 1;              // varint enum
//!   Value value = 2;            // oneof sub-message
//! }
//! message Value {
//!   oneof value {
//!     string string_value = 1;
//!     int32 int_value = 2;
//!     int64 long_value = 3;
//!     float float_value = 4;
//!     double double_value = 5;
//!     bool boolean_value = 6;
//!     LocationValue location_value = 7;  // {latitude = 1, longitude = 2}
//!   }
//! }
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::error::DecodeError;

use super::fields::field_name;

/// One decoded telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Location { latitude: f64, longitude: f64 },
}

impl TelemetryValue {
    /// Wire type name, matching the proto oneof arms.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::Location { .. } => "location",
        }
    }

    /// Numeric view for threshold comparisons. Strings parse when they
    /// look like numbers; locations and non-numeric strings don't.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Location { .. } => None,
        }
    }

    /// Latitude/longitude view for location values.
    pub fn as_location(&self) -> Option<(f64, f64)> {
        match self {
            Self::Location {
                latitude,
                longitude,
            } => Some((*latitude, *longitude)),
            _ => None,
        }
    }

    /// JSON rendering used by sinks and event payloads.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Int(v) => serde_json::json!(v),
            Self::Float(v) => serde_json::json!(v),
            Self::Bool(v) => serde_json::Value::Bool(*v),
            Self::Location {
                latitude,
                longitude,
            } => serde_json::json!({"latitude": latitude, "longitude": longitude}),
        }
    }
}

impl std::fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Location {
                latitude,
                longitude,
            } => write!(f, "latitude={latitude};longitude={longitude}"),
        }
    }
}

/// A single decoded telemetry field.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryDatum {
    pub field_name: String,
    pub field_id: u32,
    pub value: TelemetryValue,
    pub value_type: &'static str,
}

/// A decoded telemetry payload from one vehicle push.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryFrame {
    pub vin: String,
    pub created_at: DateTime<Utc>,
    pub data: Vec<TelemetryDatum>,
    pub is_resend: bool,
}

/// Decodes binary payload messages into [`TelemetryFrame`]s.
#[derive(Debug, Default, Clone)]
pub struct TelemetryDecoder;

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one payload message.
    ///
    /// Unknown wire tags are skipped; trailing garbage inside a
    /// sub-record never aborts the frame. Only bytes that defeat
    /// top-level parsing produce a [`DecodeError`].
    pub fn decode(&self, raw: &[u8]) -> Result<TelemetryFrame, DecodeError> {
        let mut data = Vec::new();
        let mut created_at = Utc::now();
        let mut vin = String::new();
        let mut is_resend = false;

        let mut reader = WireReader::new(raw);
        while let Some((field, wire)) = reader.next_tag()? {
            match (field, wire) {
                (1, WireValue::Bytes(sub)) => {
                    if let Some(datum) = decode_datum(sub) {
                        data.push(datum);
                    }
                }
                (2, WireValue::Bytes(sub)) => {
                    created_at = decode_timestamp(sub).unwrap_or(created_at);
                }
                (3, WireValue::Bytes(sub)) => {
                    vin = String::from_utf8_lossy(sub).into_owned();
                }
                (4, WireValue::Varint(v)) => {
                    is_resend = v != 0;
                }
                _ => {}
            }
        }

        Ok(TelemetryFrame {
            vin,
            created_at,
            data,
            is_resend,
        })
    }
}

/// Decode a `Datum` sub-message; `None` when no field id is present.
fn decode_datum(raw: &[u8]) -> Option<TelemetryDatum> {
    let mut field_id = 0u32;
    let mut value = None;

    let mut reader = WireReader::new(raw);
    while let Ok(Some((field, wire))) = reader.next_tag() {
        match (field, wire) {
            (1, WireValue::Varint(v)) => field_id = v as u32,
            (2, WireValue::Bytes(sub)) => value = decode_value(sub),
            _ => {}
        }
    }

    if field_id == 0 {
        return None;
    }

    let value = value?;
    Some(TelemetryDatum {
        field_name: field_name(field_id),
        field_id,
        value_type: value.type_name(),
        value,
    })
}

/// Decode a `Value` oneof sub-message.
fn decode_value(raw: &[u8]) -> Option<TelemetryValue> {
    let mut reader = WireReader::new(raw);
    while let Ok(Some((field, wire))) = reader.next_tag() {
        match (field, wire) {
            (1, WireValue::Bytes(sub)) => {
                return Some(TelemetryValue::Text(String::from_utf8_lossy(sub).into_owned()));
            }
            // int32 / int64 — plain varint, not zigzag
            (2, WireValue::Varint(v)) | (3, WireValue::Varint(v)) => {
                return Some(TelemetryValue::Int(v as i64));
            }
            (4, WireValue::Fixed32(bits)) => {
                return Some(TelemetryValue::Float(f64::from(f32::from_le_bytes(
                    bits.to_le_bytes(),
                ))));
            }
            (5, WireValue::Fixed64(bits)) => {
                return Some(TelemetryValue::Float(f64::from_le_bytes(bits.to_le_bytes())));
            }
            (6, WireValue::Varint(v)) => {
                return Some(TelemetryValue::Bool(v != 0));
            }
            (7, WireValue::Bytes(sub)) => {
                return Some(decode_location(sub));
            }
            _ => {}
        }
    }
    None
}

/// Decode a `LocationValue` sub-message (two fixed64 doubles).
fn decode_location(raw: &[u8]) -> TelemetryValue {
    let mut latitude = 0.0;
    let mut longitude = 0.0;
    let mut reader = WireReader::new(raw);
    while let Ok(Some((field, wire))) = reader.next_tag() {
        if let WireValue::Fixed64(bits) = wire {
            let v = f64::from_le_bytes(bits.to_le_bytes());
            match field {
                1 => latitude = v,
                2 => longitude = v,
                _ => {}
            }
        }
    }
    TelemetryValue::Location {
        latitude,
        longitude,
    }
}

/// Decode a protobuf `Timestamp` sub-message.
fn decode_timestamp(raw: &[u8]) -> Option<DateTime<Utc>> {
    let mut seconds = 0i64;
    let mut nanos = 0u32;
    let mut reader = WireReader::new(raw);
    while let Ok(Some((field, wire))) = reader.next_tag() {
        if let WireValue::Varint(v) = wire {
            match field {
                1 => seconds = v as i64,
                2 => nanos = v as u32,
                _ => {}
            }
        }
    }
    Utc.timestamp_opt(seconds, nanos).single()
}

/// One decoded wire value.
enum WireValue<'a> {
    Varint(u64),
    Fixed64(u64),
    Bytes(&'a [u8]),
    Fixed32(u32),
}

/// Minimal protobuf wire reader over a byte slice.
struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read the next `(field_number, value)` pair, or `None` at the end.
    fn next_tag(&mut self) -> Result<Option<(u32, WireValue<'a>)>, DecodeError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        let wire_type = (key & 0x07) as u8;

        let value = match wire_type {
            0 => WireValue::Varint(self.read_varint()?),
            1 => {
                let bytes = self.take(8, wire_type)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(bytes);
                WireValue::Fixed64(u64::from_le_bytes(arr))
            }
            2 => {
                let len = self.read_varint()? as usize;
                WireValue::Bytes(self.take(len, wire_type)?)
            }
            5 => {
                let bytes = self.take(4, wire_type)?;
                let mut arr = [0u8; 4];
                arr.copy_from_slice(bytes);
                WireValue::Fixed32(u32::from_le_bytes(arr))
            }
            other => return Err(DecodeError::UnsupportedWireType(other)),
        };

        Ok(Some((field, value)))
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let start = self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(DecodeError::TruncatedVarint(start));
            };
            self.pos += 1;
            if shift < 64 {
                result |= u64::from(byte & 0x7F) << shift;
            }
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 70 {
                return Err(DecodeError::TruncatedVarint(start));
            }
        }
    }

    fn take(&mut self, len: usize, wire_type: u8) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::TruncatedField {
            wire_type,
            offset: self.pos,
        })?;
        if end > self.buf.len() {
            return Err(DecodeError::TruncatedField {
                wire_type,
                offset: self.pos,
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

//! Shared helpers: a minimal encoder for the telemetry wire format so
//! tests can synthesize the binary frames a vehicle would push.

#![allow(dead_code)]

pub fn varint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

pub fn tag(field: u32, wire_type: u8) -> Vec<u8> {
    varint(u64::from(field) << 3 | u64::from(wire_type))
}

pub fn bytes_field(field: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = tag(field, 2);
    out.extend(varint(payload.len() as u64));
    out.extend_from_slice(payload);
    out
}

pub fn varint_field(field: u32, v: u64) -> Vec<u8> {
    let mut out = tag(field, 0);
    out.extend(varint(v));
    out
}

pub fn double_field(field: u32, v: f64) -> Vec<u8> {
    let mut out = tag(field, 1);
    out.extend_from_slice(&v.to_le_bytes());
    out
}

/// Encode a Value sub-message holding an int.
pub fn int_value(v: i64) -> Vec<u8> {
    varint_field(2, v as u64)
}

/// Encode a Value sub-message holding a location.
pub fn location_value(latitude: f64, longitude: f64) -> Vec<u8> {
    let mut loc = double_field(1, latitude);
    loc.extend(double_field(2, longitude));
    bytes_field(7, &loc)
}

/// Encode a Value sub-message holding a string.
pub fn string_value(s: &str) -> Vec<u8> {
    bytes_field(1, s.as_bytes())
}

/// Encode a full Payload frame: one datum per `(field_id, value_msg)`.
pub fn payload(vin: &str, datums: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (field_id, value_msg) in datums {
        let mut datum = varint_field(1, u64::from(*field_id));
        datum.extend(bytes_field(2, value_msg));
        out.extend(bytes_field(1, &datum));
    }
    out.extend(bytes_field(3, vin.as_bytes()));
    out
}

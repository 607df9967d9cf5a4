//! JSON output envelope.
//!
//! Every command in JSON mode prints exactly one envelope:
//! success is `{ok: true, command, data, timestamp}`, failure is
//! `{ok: false, command, error: {code, message}, timestamp}`.

use chrono::Utc;
use serde_json::Value;

/// Build a success envelope as a JSON value.
pub fn ok(command: &str, data: Value) -> Value {
    serde_json::json!({
        "ok": true,
        "command": command,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Build an error envelope as a JSON value.
pub fn err(command: &str, code: &str, message: impl Into<String>) -> Value {
    serde_json::json!({
        "ok": false,
        "command": command,
        "error": { "code": code, "message": message.into() },
        "timestamp": Utc::now().to_rfc3339(),
    })
}

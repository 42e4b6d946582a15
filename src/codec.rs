//! Wire codec for mesh datagrams.
//!
//! ## Formats
//!
//! The primary on-the-wire format is a 12-byte framed binary header followed
//! by a UTF-8 JSON object body:
//!
//! ```text
//! offset 0  u16 BE  signal_type
//! offset 2  u16 BE  protocol_version (current 0x0100)
//! offset 4  u32 BE  payload_length
//! offset 8  u32 BE  timestamp (Unix seconds)
//! offset 12 ..      payload JSON, exactly payload_length bytes
//! ```
//!
//! Three legacy text formats are still accepted on decode, tried in order
//! after a failed binary parse.  They exist for compatibility with older
//! mesh nodes; new code only ever emits the binary format.
//!
//! Decoding never panics and never errors: a malformed datagram decodes to
//! `None` and is dropped by the caller.

use serde_json::{Map, Value};

/// Current protocol version carried in the binary header.
pub const PROTOCOL_VERSION: u16 = 0x0100;

/// Length of the fixed binary header.
pub const HEADER_LEN: usize = 12;

/// Numeric signal-type registry.  The values are part of the external
/// contract shared by every node in the mesh and must not change.
pub mod signal {
    pub const DOCK_REQUEST: u16 = 0x01;
    pub const DOCK_APPROVED: u16 = 0x02;
    pub const DOCK_REJECTED: u16 = 0x03;
    pub const HEARTBEAT: u16 = 0x04;
    pub const UNDOCK: u16 = 0x05;
    pub const RELAY_REQUEST: u16 = 0x50;
    pub const RELAY_RESPONSE: u16 = 0x51;
    pub const RELAY_FAILED: u16 = 0x52;
    pub const BUFFER_FLUSH: u16 = 0x53;
    pub const BUFFER_RETRY: u16 = 0x54;
    pub const ERROR: u16 = 0xF0;
    pub const PING: u16 = 0xF1;
    pub const PONG: u16 = 0xF2;
    pub const SHUTDOWN: u16 = 0xFF;
}

/// Map a legacy symbolic signal name to its numeric code.
///
/// Unknown names map to `0x00`, which the tumbler rejects.
pub fn code_from_name(name: &str) -> u16 {
    match name {
        "DOCK_REQUEST" => signal::DOCK_REQUEST,
        "DOCK_APPROVED" => signal::DOCK_APPROVED,
        "DOCK_REJECTED" => signal::DOCK_REJECTED,
        "HEARTBEAT" => signal::HEARTBEAT,
        "UNDOCK" => signal::UNDOCK,
        "RELAY_REQUEST" => signal::RELAY_REQUEST,
        "RELAY_RESPONSE" => signal::RELAY_RESPONSE,
        "RELAY_FAILED" => signal::RELAY_FAILED,
        "BUFFER_FLUSH" => signal::BUFFER_FLUSH,
        "BUFFER_RETRY" => signal::BUFFER_RETRY,
        "ERROR" => signal::ERROR,
        "PING" => signal::PING,
        "PONG" => signal::PONG,
        "SHUTDOWN" => signal::SHUTDOWN,
        _ => 0x00,
    }
}

/// A datagram decoded from any accepted wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    pub signal_type: u16,
    /// Protocol version from the binary header; legacy formats report
    /// [`PROTOCOL_VERSION`].
    pub protocol_version: u16,
    /// Unix seconds.
    pub timestamp: u64,
    pub payload: Map<String, Value>,
}

impl DecodedSignal {
    /// The `sender` field injected into the payload by the encoder, if any.
    pub fn sender(&self) -> Option<&str> {
        self.payload.get("sender").and_then(Value::as_str)
    }
}

/// Encode a signal in the primary binary format.
///
/// The `sender` name is injected into the payload object before
/// serialization so receivers can attribute the datagram.
pub fn encode_signal(
    signal_type: u16,
    sender: &str,
    payload: &Map<String, Value>,
    timestamp: u64,
) -> Vec<u8> {
    let mut body = payload.clone();
    body.insert("sender".to_string(), Value::String(sender.to_string()));
    let body_bytes = serde_json::to_vec(&Value::Object(body)).unwrap_or_else(|_| b"{}".to_vec());

    let mut frame = Vec::with_capacity(HEADER_LEN + body_bytes.len());
    frame.extend_from_slice(&signal_type.to_be_bytes());
    frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
    frame.extend_from_slice(&(body_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&(timestamp as u32).to_be_bytes());
    frame.extend_from_slice(&body_bytes);
    frame
}

/// Decode a datagram, trying the binary format first and falling back to the
/// three legacy text formats in order.  Returns `None` when nothing parses.
pub fn decode_datagram(data: &[u8]) -> Option<DecodedSignal> {
    if let Some(decoded) = decode_binary(data) {
        return Some(decoded);
    }
    let text = std::str::from_utf8(data).ok()?;
    decode_legacy_short_json(text)
        .or_else(|| decode_legacy_long_json(text))
        .or_else(|| decode_legacy_colon(text))
}

fn decode_binary(data: &[u8]) -> Option<DecodedSignal> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let signal_type = u16::from_be_bytes([data[0], data[1]]);
    let protocol_version = u16::from_be_bytes([data[2], data[3]]);
    let payload_length = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as u64;

    if signal_type == 0 || signal_type > 0xFF {
        return None;
    }
    if payload_length > data.len() - HEADER_LEN {
        return None;
    }

    let body = &data[HEADER_LEN..HEADER_LEN + payload_length];
    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };

    Some(DecodedSignal {
        signal_type,
        protocol_version,
        timestamp,
        payload,
    })
}

/// Read a signal type that may be numeric or a legacy symbolic name.
fn signal_type_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => Some(code_from_name(s)),
        _ => None,
    }
}

/// Legacy format 1: `{"t": <type>, "s": <sender>, "d": {..}, "ts": <epoch_ms>}`.
fn decode_legacy_short_json(text: &str) -> Option<DecodedSignal> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let signal_type = signal_type_from_value(obj.get("t")?)?;
    let sender = obj.get("s")?.as_str()?.to_string();
    let timestamp = obj.get("ts")?.as_u64()? / 1000;

    let mut payload = match obj.get("d") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) | None => Map::new(),
    };
    payload.insert("sender".to_string(), Value::String(sender));

    Some(DecodedSignal {
        signal_type,
        protocol_version: PROTOCOL_VERSION,
        timestamp,
        payload,
    })
}

/// Legacy format 2: `{"type": .., "source": .., "payload": {..}, "timestamp": <epoch_ms>}`.
fn decode_legacy_long_json(text: &str) -> Option<DecodedSignal> {
    let value: Value = serde_json::from_str(text).ok()?;
    let obj = value.as_object()?;
    let signal_type = signal_type_from_value(obj.get("type")?)?;
    let sender = obj.get("source")?.as_str()?.to_string();
    let timestamp = obj.get("timestamp")?.as_u64()? / 1000;

    let mut payload = match obj.get("payload") {
        Some(Value::Object(map)) => map.clone(),
        Some(_) | None => Map::new(),
    };
    payload.insert("sender".to_string(), Value::String(sender));

    Some(DecodedSignal {
        signal_type,
        protocol_version: PROTOCOL_VERSION,
        timestamp,
        payload,
    })
}

/// Legacy format 3: colon-delimited `TYPE:SENDER:PAYLOAD_JSON:TIMESTAMP_MS`.
///
/// The payload JSON may itself contain colons, so the first two and the last
/// delimiter are positional.
fn decode_legacy_colon(text: &str) -> Option<DecodedSignal> {
    let (type_part, rest) = text.split_once(':')?;
    let (sender_part, rest) = rest.split_once(':')?;
    let (payload_part, ts_part) = rest.rsplit_once(':')?;

    let signal_type = match type_part.parse::<u16>() {
        Ok(n) => n,
        Err(_) => code_from_name(type_part),
    };
    let timestamp = ts_part.trim().parse::<u64>().ok()? / 1000;

    let mut payload = match serde_json::from_str::<Value>(payload_part) {
        Ok(Value::Object(map)) => map,
        _ => return None,
    };
    payload.insert(
        "sender".to_string(),
        Value::String(sender_part.to_string()),
    );

    Some(DecodedSignal {
        signal_type,
        protocol_version: PROTOCOL_VERSION,
        timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload_of(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn binary_round_trip_preserves_type_and_payload() {
        let payload = payload_of(&[("x", json!(1)), ("flag", json!(true))]);
        let frame = encode_signal(signal::RELAY_REQUEST, "alpha", &payload, 1_700_000_000);

        let decoded = decode_datagram(&frame).expect("binary decode");
        assert_eq!(decoded.signal_type, signal::RELAY_REQUEST);
        assert_eq!(decoded.protocol_version, PROTOCOL_VERSION);
        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.sender(), Some("alpha"));
        assert_eq!(decoded.payload.get("x"), Some(&json!(1)));
        assert_eq!(decoded.payload.get("flag"), Some(&json!(true)));
    }

    #[test]
    fn binary_rejects_zero_signal_type() {
        let payload = Map::new();
        let mut frame = encode_signal(signal::PING, "a", &payload, 1);
        frame[0] = 0;
        frame[1] = 0;
        assert!(decode_datagram(&frame).is_none());
    }

    #[test]
    fn binary_rejects_truncated_body() {
        let payload = payload_of(&[("k", json!("v"))]);
        let mut frame = encode_signal(signal::PING, "a", &payload, 1);
        frame.truncate(frame.len() - 4);
        // Declared payload_length now exceeds the remaining bytes.
        assert!(decode_datagram(&frame).is_none());
    }

    #[test]
    fn binary_rejects_non_object_body() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0x50u16.to_be_bytes());
        frame.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(b"[1,2]");
        assert!(decode_datagram(&frame).is_none());
    }

    #[test]
    fn legacy_short_json_maps_fields() {
        let text = r#"{"t": "HEARTBEAT", "s": "beta", "d": {"load": 3}, "ts": 1700000000500}"#;
        let decoded = decode_datagram(text.as_bytes()).expect("legacy decode");
        assert_eq!(decoded.signal_type, signal::HEARTBEAT);
        assert_eq!(decoded.timestamp, 1_700_000_000);
        assert_eq!(decoded.sender(), Some("beta"));
        assert_eq!(decoded.payload.get("load"), Some(&json!(3)));
    }

    #[test]
    fn legacy_long_json_maps_fields() {
        let text =
            r#"{"type": 80, "source": "gamma", "payload": {"a": "b"}, "timestamp": 1700000001000}"#;
        let decoded = decode_datagram(text.as_bytes()).expect("legacy decode");
        assert_eq!(decoded.signal_type, 0x50);
        assert_eq!(decoded.timestamp, 1_700_000_001);
        assert_eq!(decoded.sender(), Some("gamma"));
        assert_eq!(decoded.payload.get("a"), Some(&json!("b")));
    }

    #[test]
    fn legacy_colon_format_allows_colons_in_payload() {
        let text = r#"PING:delta:{"note":"a:b:c"}:1700000002000"#;
        let decoded = decode_datagram(text.as_bytes()).expect("colon decode");
        assert_eq!(decoded.signal_type, signal::PING);
        assert_eq!(decoded.timestamp, 1_700_000_002);
        assert_eq!(decoded.sender(), Some("delta"));
        assert_eq!(decoded.payload.get("note"), Some(&json!("a:b:c")));
    }

    #[test]
    fn unknown_symbolic_name_maps_to_zero() {
        let text = r#"{"t": "WARP_DRIVE", "s": "x", "d": {}, "ts": 1700000000000}"#;
        let decoded = decode_datagram(text.as_bytes()).expect("decode");
        assert_eq!(decoded.signal_type, 0x00);
    }

    #[test]
    fn garbage_decodes_to_none() {
        assert!(decode_datagram(b"").is_none());
        assert!(decode_datagram(b"hello world").is_none());
        assert!(decode_datagram(&[0xFF; 11]).is_none());
    }
}

//! Engine.IO v4 / Socket.IO v5 text frames.
//!
//! Every WebSocket text frame starts with an Engine.IO packet type digit.
//! Type `4` (message) carries a Socket.IO packet whose own type digit follows
//! immediately, then an optional namespace, an optional ack id and a JSON body:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open
//! 2                                                         ping
//! 40                                                        namespace connect
//! 42["call:incoming",{"from":"..",...}]                     event
//! 4217["call:incoming",{...}]                               event, ack id 17
//! 44{"message":"unauthorized"}                              connect error
//! ```

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Namespace connect request for the default namespace.
pub const CONNECT: &str = "40";
/// Reply to an Engine.IO ping.
pub const PONG: &str = "3";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown packet type in frame {0:?}")]
    UnknownType(String),
    #[error("bad JSON in frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event frame is not a [name, ...] array")]
    NotAnEvent,
}

/// Engine.IO handshake data.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    /// Namespace connected.
    Connect,
    Disconnect,
    ConnectError(Value),
    Event {
        name: String,
        data: Value,
        ack: Option<u64>,
    },
    /// Frames this client has no use for (acks, binary, upgrades).
    Other(String),
}

impl Packet {
    pub fn decode(frame: &str) -> Result<Self, FrameError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(FrameError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping),
            '3' => Ok(Packet::Pong),
            '4' => decode_message(rest),
            '5' | '6' => Ok(Packet::Other(frame.to_string())),
            _ => Err(FrameError::UnknownType(frame.to_string())),
        }
    }
}

fn decode_message(frame: &str) -> Result<Packet, FrameError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(FrameError::Empty)?;
    let rest = skip_namespace(chars.as_str());
    match kind {
        '0' => Ok(Packet::Connect),
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            let ack = if digits > 0 {
                rest[..digits].parse().ok()
            } else {
                None
            };
            let (name, data) = decode_event(&rest[digits..])?;
            Ok(Packet::Event { name, data, ack })
        }
        '4' => {
            let data = if rest.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(rest)?
            };
            Ok(Packet::ConnectError(data))
        }
        _ => Ok(Packet::Other(format!("4{}", frame))),
    }
}

/// Drop a `/namespace,` prefix.
fn skip_namespace(s: &str) -> &str {
    if s.starts_with('/') {
        s.find(',').map_or("", |i| &s[i + 1..])
    } else {
        s
    }
}

fn decode_event(body: &str) -> Result<(String, Value), FrameError> {
    let value: Value = serde_json::from_str(body)?;
    let Value::Array(mut items) = value else {
        return Err(FrameError::NotAnEvent);
    };
    if items.is_empty() {
        return Err(FrameError::NotAnEvent);
    }
    let name = match items.remove(0) {
        Value::String(name) => name,
        _ => return Err(FrameError::NotAnEvent),
    };
    // Only the first argument is meaningful for call events.
    let data = if items.is_empty() {
        Value::Null
    } else {
        items.swap_remove(0)
    };
    Ok((name, data))
}

/// Encode an event on the default namespace.
pub fn encode_event(name: &str, data: &Value) -> String {
    format!("42{}", Value::Array(vec![Value::String(name.to_string()), data.clone()]))
}

/// Acknowledge an event that carried an ack id.
pub fn encode_ack(id: u64) -> String {
    format!("43{}[]", id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let frame = r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match Packet::decode(frame).unwrap() {
            Packet::Open(info) => {
                assert_eq!(info.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(info.ping_interval, 25000);
                assert_eq!(info.ping_timeout, 20000);
            }
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_packets() {
        assert_eq!(Packet::decode("2").unwrap(), Packet::Ping);
        assert_eq!(Packet::decode("3").unwrap(), Packet::Pong);
        assert_eq!(Packet::decode("1").unwrap(), Packet::Close);
        assert_eq!(
            Packet::decode(r#"40{"sid":"wZX3oN0bSVIhsaknAAAI"}"#).unwrap(),
            Packet::Connect
        );
        assert_eq!(Packet::decode("41").unwrap(), Packet::Disconnect);
    }

    #[test]
    fn test_decode_event() {
        let frame = r#"42["call:ended",{"from":"64b7f0c2a1"}]"#;
        assert_eq!(
            Packet::decode(frame).unwrap(),
            Packet::Event {
                name: "call:ended".into(),
                data: json!({"from": "64b7f0c2a1"}),
                ack: None,
            }
        );
    }

    #[test]
    fn test_decode_event_with_ack_and_namespace() {
        let frame = r#"42/calls,17["call:rejected"]"#;
        assert_eq!(
            Packet::decode(frame).unwrap(),
            Packet::Event {
                name: "call:rejected".into(),
                data: Value::Null,
                ack: Some(17),
            }
        );
    }

    #[test]
    fn test_decode_connect_error() {
        match Packet::decode(r#"44{"message":"Not authorized"}"#).unwrap() {
            Packet::ConnectError(data) => assert_eq!(data["message"], "Not authorized"),
            other => panic!("expected connect error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Packet::decode(""), Err(FrameError::Empty)));
        assert!(matches!(Packet::decode("x"), Err(FrameError::UnknownType(_))));
        assert!(matches!(Packet::decode(r#"42{"a":1}"#), Err(FrameError::NotAnEvent)));
        assert!(matches!(Packet::decode("42[1]"), Err(FrameError::NotAnEvent)));
    }

    #[test]
    fn test_encode_event() {
        let frame = encode_event("call:end", &json!({"to": "p", "from": "me"}));
        assert_eq!(frame, r#"42["call:end",{"from":"me","to":"p"}]"#);
        assert_eq!(encode_ack(5), "435[]");
    }
}

//! The SignalR JSON hub protocol, version 1.
//!
//! Every message is a JSON object terminated by the record separator `0x1E`. A single WebSocket text frame may carry
//! several messages, and a message may in principle be split across frames, so incoming text goes through a
//! [`FrameBuffer`].
use balance_feed_engine::TransportError;
use serde::Deserialize;
use serde_json::{json, Value};

pub const RECORD_SEPARATOR: char = '\u{1e}';
pub const PROTOCOL_NAME: &str = "json";
pub const PROTOCOL_VERSION: u32 = 1;

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation { invocation_id: Option<String>, target: String, arguments: Vec<Value> },
    Completion { invocation_id: String, result: Option<Value>, error: Option<String> },
    Ping,
    Close { error: Option<String>, allow_reconnect: bool },
    /// Streaming and other message types this client never asks for.
    Unsupported(u8),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: Option<String>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: bool,
}

pub fn parse_message(frame: &str) -> Result<HubMessage, TransportError> {
    let raw: RawMessage = serde_json::from_str(frame)
        .map_err(|e| TransportError::Protocol(format!("Invalid hub message. {e}. Message: {frame}")))?;
    let message = match raw.kind {
        INVOCATION => {
            let target =
                raw.target.ok_or_else(|| TransportError::Protocol("Invocation message without a target".into()))?;
            HubMessage::Invocation { invocation_id: raw.invocation_id, target, arguments: raw.arguments }
        },
        COMPLETION => {
            let invocation_id = raw
                .invocation_id
                .ok_or_else(|| TransportError::Protocol("Completion message without an invocation id".into()))?;
            HubMessage::Completion { invocation_id, result: raw.result, error: raw.error }
        },
        PING => HubMessage::Ping,
        CLOSE => HubMessage::Close { error: raw.error, allow_reconnect: raw.allow_reconnect },
        other => HubMessage::Unsupported(other),
    };
    Ok(message)
}

pub fn handshake_request() -> String {
    frame(json!({"protocol": PROTOCOL_NAME, "version": PROTOCOL_VERSION}))
}

/// The server answers the handshake with `{}`, or `{"error": "..."}` if it refuses the protocol.
pub fn parse_handshake_response(frame: &str) -> Result<(), TransportError> {
    #[derive(Deserialize)]
    struct HandshakeResponse {
        error: Option<String>,
    }
    let response: HandshakeResponse = serde_json::from_str(frame)
        .map_err(|e| TransportError::Protocol(format!("Invalid handshake response. {e}. Response: {frame}")))?;
    match response.error {
        Some(error) => Err(TransportError::Protocol(format!("The hub rejected the handshake. {error}"))),
        None => Ok(()),
    }
}

pub fn encode_invocation(invocation_id: &str, target: &str, arguments: &[Value]) -> String {
    frame(json!({"type": INVOCATION, "invocationId": invocation_id, "target": target, "arguments": arguments}))
}

pub fn encode_ping() -> String {
    frame(json!({"type": PING}))
}

pub fn encode_close() -> String {
    frame(json!({"type": CLOSE}))
}

fn frame(message: Value) -> String {
    format!("{message}{RECORD_SEPARATOR}")
}

/// Reassembles record-separated messages from WebSocket text.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    partial: String,
}

impl FrameBuffer {
    /// Appends `text` and returns every message that is now complete, in order.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let Some(last) = self.partial.rfind(RECORD_SEPARATOR) else {
            return Vec::new();
        };
        let rest = self.partial.split_off(last + RECORD_SEPARATOR.len_utf8());
        let complete = std::mem::replace(&mut self.partial, rest);
        complete.split(RECORD_SEPARATOR).filter(|s| !s.trim().is_empty()).map(str::to_string).collect()
    }

    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frames_split_and_reassemble() {
        let mut buffer = FrameBuffer::default();
        assert_eq!(buffer.push("{\"type\":6}\u{1e}{\"type\":1,"), vec!["{\"type\":6}".to_string()]);
        assert!(buffer.has_partial());
        let frames = buffer.push("\"target\":\"ReceiveBalance\",\"arguments\":[5]}\u{1e}");
        assert_eq!(frames, vec!["{\"type\":1,\"target\":\"ReceiveBalance\",\"arguments\":[5]}".to_string()]);
        assert!(!buffer.has_partial());
    }

    #[test]
    fn several_messages_in_one_frame() {
        let mut buffer = FrameBuffer::default();
        let frames = buffer.push("{}\u{1e}{\"type\":6}\u{1e}");
        assert_eq!(frames, vec!["{}".to_string(), "{\"type\":6}".to_string()]);
    }

    #[test]
    fn parse_server_messages() {
        let msg = parse_message(r#"{"type":1,"target":"ReceiveBalance","arguments":[{"balance":3.5}]}"#).unwrap();
        assert_eq!(msg, HubMessage::Invocation {
            invocation_id: None,
            target: "ReceiveBalance".into(),
            arguments: vec![json!({"balance": 3.5})],
        });
        let msg = parse_message(r#"{"type":3,"invocationId":"7","error":"no such group"}"#).unwrap();
        assert_eq!(msg, HubMessage::Completion {
            invocation_id: "7".into(),
            result: None,
            error: Some("no such group".into()),
        });
        assert_eq!(parse_message(r#"{"type":6}"#).unwrap(), HubMessage::Ping);
        assert_eq!(
            parse_message(r#"{"type":7,"error":"shutting down","allowReconnect":true}"#).unwrap(),
            HubMessage::Close { error: Some("shutting down".into()), allow_reconnect: true }
        );
        assert_eq!(parse_message(r#"{"type":2,"invocationId":"1","item":1}"#).unwrap(), HubMessage::Unsupported(2));
        assert!(matches!(parse_message("not json"), Err(TransportError::Protocol(_))));
        assert!(matches!(parse_message(r#"{"type":1}"#), Err(TransportError::Protocol(_))));
    }

    #[test]
    fn encoded_messages() {
        assert_eq!(handshake_request(), "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert_eq!(encode_ping(), "{\"type\":6}\u{1e}");
        let invocation = encode_invocation("0", "JoinGroup", &[json!("balance-group-1")]);
        let body: Value = serde_json::from_str(invocation.trim_end_matches(RECORD_SEPARATOR)).unwrap();
        assert_eq!(
            body,
            json!({"type": 1, "invocationId": "0", "target": "JoinGroup", "arguments": ["balance-group-1"]})
        );
    }

    #[test]
    fn handshake_responses() {
        assert!(parse_handshake_response("{}").is_ok());
        let err = parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}

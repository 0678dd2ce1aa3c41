//! Envelope and payload types for the tunnel channel wire format.
//!
//! One envelope is one framed JSON message carried as a single WebSocket
//! text frame. `type` and `payload` are adjacently tagged so the wire shape
//! is exactly `{"correlationId", "type", "timestamp", "payload"}`.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decoded request/response body size limit, enforced at the producer.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Request headers this system strips before crossing a proxy boundary.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(header_name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(header_name))
}

/// A single framed message on the tunnel channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "correlationId")]
    pub correlation_id: String,
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EnvelopeBody {
    #[serde(rename = "REQUEST")]
    Request(RequestPayload),
    #[serde(rename = "RESPONSE")]
    Response(ResponsePayload),
    #[serde(rename = "ERROR")]
    Error(ErrorPayload),
    #[serde(rename = "CONTROL")]
    Control(ControlPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPayload {
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Vec<(String, String)>>,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(rename = "websocketUpgrade", default)]
    pub websocket_upgrade: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "UPSTREAM_ERROR")]
    UpstreamError,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "SERVER_ERROR")]
    ServerError,
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
}

impl ErrorCode {
    /// Maps an error kind carried on the channel to the public HTTP status
    /// it should produce. `UpstreamError` maps to 503 rather than a generic
    /// 502: this repo's only producer of `UpstreamError` is a tunnel
    /// disconnecting while a request is in-flight, which callers should be
    /// able to tell apart from an outright malformed request. See
    /// DESIGN.md.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::Timeout => 504,
            ErrorCode::UpstreamError => 503,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::ServerError => 500,
            ErrorCode::RateLimited => 429,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlAction {
    #[serde(rename = "REGISTER")]
    Register,
    #[serde(rename = "REGISTERED")]
    Registered,
    #[serde(rename = "UNREGISTER")]
    Unregister,
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "DISCONNECT")]
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    #[serde(rename = "NEW_CONNECTION")]
    NewConnection,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(rename = "publicUrl", default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DisconnectReason>,
}

impl Envelope {
    pub fn request(correlation_id: impl Into<String>, payload: RequestPayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: EnvelopeBody::Request(payload),
            timestamp: Utc::now(),
        }
    }

    pub fn response(correlation_id: impl Into<String>, payload: ResponsePayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: EnvelopeBody::Response(payload),
            timestamp: Utc::now(),
        }
    }

    pub fn error(correlation_id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: EnvelopeBody::Error(ErrorPayload {
                code,
                message: message.into(),
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn control(correlation_id: impl Into<String>, payload: ControlPayload) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: EnvelopeBody::Control(payload),
            timestamp: Utc::now(),
        }
    }

    /// Generates a fresh correlation id suitable for a new pending request.
    pub fn new_correlation_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Serializes an envelope to its JSON text-frame form.
pub fn encode(envelope: &Envelope) -> Result<String> {
    serde_json::to_string(envelope).map_err(|e| Error::Protocol(e.to_string()))
}

/// Parses a JSON text frame into an envelope.
///
/// Unknown envelope types (an unrecognized `type` discriminant) and
/// malformed JSON both surface as `Error::InvalidMessage` — callers reply
/// with `ERROR/INVALID_REQUEST` and otherwise ignore the frame rather than
/// closing the channel.
pub fn decode(text: &str) -> Result<Envelope> {
    serde_json::from_str(text).map_err(|_| Error::InvalidMessage)
}

pub fn encode_body(raw: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(raw)
}

pub fn decode_body(encoded: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Protocol(format!("invalid base64 body: {e}")))
}

/// Joins multi-valued headers with ", " the way a single-string header map
/// on the wire requires.
pub fn join_multi_value<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_request_round_trips() {
        let env = Envelope::request(
            "c-1",
            RequestPayload {
                method: "GET".into(),
                path: "/hello".into(),
                query: None,
                headers: vec![("accept".into(), "*/*".into())],
                body: None,
                websocket_upgrade: false,
            },
        );
        let json = encode(&env).unwrap();
        let decoded = decode(&json).unwrap();
        assert_eq!(decoded.correlation_id, "c-1");
        match decoded.body {
            EnvelopeBody::Request(p) => {
                assert_eq!(p.method, "GET");
                assert_eq!(p.path, "/hello");
                assert!(p.body.is_none());
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn envelope_response_round_trips_with_body() {
        let body = encode_body(b"world");
        let env = Envelope::response(
            "c-2",
            ResponsePayload {
                status_code: 200,
                headers: vec![],
                body: Some(body.clone()),
            },
        );
        let json = encode(&env).unwrap();
        let decoded = decode(&json).unwrap();
        match decoded.body {
            EnvelopeBody::Response(p) => {
                assert_eq!(p.status_code, 200);
                assert_eq!(decode_body(&p.body.unwrap()).unwrap(), b"world");
            }
            other => panic!("expected Response, got {other:?}"),
        }
    }

    #[test]
    fn wire_shape_matches_spec_keys() {
        let env = Envelope::error("c-3", ErrorCode::Timeout, "deadline exceeded");
        let json = encode(&env).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["correlationId"], "c-3");
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["code"], "TIMEOUT");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn unknown_type_is_rejected_without_side_effects() {
        let bogus = r#"{"correlationId":"c-4","type":"BOGUS","timestamp":"2024-01-01T00:00:00Z","payload":{}}"#;
        assert!(matches!(decode(bogus), Err(Error::InvalidMessage)));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let json = r#"{"correlationId":"c-5","type":"CONTROL","timestamp":"2024-01-01T00:00:00Z","payload":{"action":"PING","futureField":"ignored"}}"#;
        let env = decode(json).unwrap();
        match env.body {
            EnvelopeBody::Control(p) => assert_eq!(p.action, ControlAction::Ping),
            other => panic!("expected Control, got {other:?}"),
        }
    }

    #[test]
    fn base64_body_round_trips() {
        let raw = b"the quick brown fox\x00\x01\x02";
        let encoded = encode_body(raw);
        let decoded = decode_body(&encoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn hop_by_hop_detection_is_case_insensitive() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[test]
    fn multi_value_headers_join_with_comma_space() {
        assert_eq!(join_multi_value(["a", "b", "c"].into_iter()), "a, b, c");
    }

    #[test]
    fn error_code_http_status_mapping() {
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::UpstreamError.http_status(), 503);
        assert_eq!(ErrorCode::InvalidRequest.http_status(), 400);
        assert_eq!(ErrorCode::ServerError.http_status(), 500);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
    }
}

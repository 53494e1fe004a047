//
// Copyright 2026 Moltz Project. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Wire frames for the gateway protocol.
//!
//! Every message on the connection is a single JSON envelope of one of three
//! kinds: a request (`"type": "req"`), a response (`"type": "res"`), or a
//! server-pushed event (`"type": "evt"`). Requests carry a caller-generated
//! string id that the matching response echoes back; streamed responses
//! arrive as a series of partial frames (`done: false`) followed by exactly
//! one terminal frame.
//!
//! Parsing is strict about structure but tolerant of unknown fields, so the
//! gateway can add envelope fields without breaking older clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: i64 = 3;

/// Errors produced while parsing or encoding wire frames.
///
/// Protocol errors are logged and dropped by the read loop; they do not tear
/// down the session unless the transport itself fails.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("invalid JSON: {message}")]
    InvalidJson {
        /// Parser diagnostic.
        message: String,
    },

    /// The envelope was missing a required field for its kind.
    #[error("frame missing required field '{field}'")]
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },

    /// The envelope carried an unrecognized `type` value.
    #[error("unknown frame type '{value}'")]
    UnknownType {
        /// The offending `type` value.
        value: String,
    },
}

/// Machine-readable error body attached to a failed response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error cause, e.g. `UNAUTHORIZED` or `auth-failed`.
    #[serde(alias = "cause")]
    pub code: String,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
    /// Optional structured context.
    #[serde(default)]
    pub details: Option<Value>,
    /// Server hint whether the operation may be retried.
    #[serde(default)]
    pub retryable: Option<bool>,
}

/// A server-pushed event frame.
#[derive(Debug, Clone)]
pub struct EventFrame {
    /// Event name, e.g. `chat` or `tick`.
    pub event: String,
    /// Server-side sequence number, when the event belongs to a stream.
    pub seq: Option<i64>,
    /// Event payload.
    pub payload: Option<Value>,
}

/// One parsed protocol frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A request initiated by either side.
    Request {
        /// Correlation id, unique within a session.
        id: String,
        /// Invoked method, e.g. `chat.send`.
        method: String,
        /// Method parameters.
        params: Option<Value>,
    },
    /// A response to a previously issued request.
    Response {
        /// Correlation id of the originating request.
        id: String,
        /// Whether the request succeeded.
        ok: bool,
        /// Response payload.
        payload: Option<Value>,
        /// Error body when `ok` is false.
        error: Option<ErrorDetail>,
        /// Chunk sequence number for streamed responses.
        seq: Option<i64>,
        /// `Some(false)` marks a partial chunk; absent or `true` is terminal.
        done: Option<bool>,
    },
    /// A server-pushed event.
    Event(EventFrame),
}

/// Raw envelope used for lenient deserialization before validation.
#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    id: Option<String>,
    method: Option<String>,
    params: Option<Value>,
    ok: Option<bool>,
    payload: Option<Value>,
    error: Option<ErrorDetail>,
    event: Option<String>,
    seq: Option<i64>,
    done: Option<bool>,
}

impl Frame {
    /// Build a request frame with a fresh UUIDv4 correlation id.
    pub fn request(method: &str, params: Option<Value>) -> Self {
        Frame::Request {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
        }
    }

    /// Parse and validate one wire frame.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] when the JSON is malformed, the `type` field
    /// is absent or unknown, or a field required by the frame kind is missing.
    pub fn parse(json: &str) -> Result<Frame, ProtocolError> {
        let raw: RawFrame =
            serde_json::from_str(json).map_err(|e| ProtocolError::InvalidJson {
                message: e.to_string(),
            })?;

        let frame_type = raw
            .frame_type
            .ok_or(ProtocolError::MissingField { field: "type" })?;

        match frame_type.as_str() {
            "req" => Ok(Frame::Request {
                id: raw.id.ok_or(ProtocolError::MissingField { field: "id" })?,
                method: raw
                    .method
                    .ok_or(ProtocolError::MissingField { field: "method" })?,
                params: raw.params,
            }),
            "res" => Ok(Frame::Response {
                id: raw.id.ok_or(ProtocolError::MissingField { field: "id" })?,
                ok: raw.ok.unwrap_or(false),
                payload: raw.payload,
                error: raw.error,
                seq: raw.seq,
                done: raw.done,
            }),
            // The original gateway emitted "event"; v3 shortened it to "evt".
            "evt" | "event" => Ok(Frame::Event(EventFrame {
                event: raw
                    .event
                    .ok_or(ProtocolError::MissingField { field: "event" })?,
                seq: raw.seq,
                payload: raw.payload,
            })),
            other => Err(ProtocolError::UnknownType {
                value: other.to_string(),
            }),
        }
    }

    /// Encode this frame as a single-line JSON envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidJson`] if a payload fails to serialize.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = match self {
            Frame::Request { id, method, params } => {
                let mut obj = serde_json::json!({
                    "type": "req",
                    "id": id,
                    "method": method,
                });
                if let Some(params) = params {
                    obj["params"] = params.clone();
                }
                obj
            }
            Frame::Response {
                id,
                ok,
                payload,
                error,
                seq,
                done,
            } => {
                let mut obj = serde_json::json!({
                    "type": "res",
                    "id": id,
                    "ok": ok,
                });
                if let Some(payload) = payload {
                    obj["payload"] = payload.clone();
                }
                if let Some(error) = error {
                    obj["error"] = serde_json::to_value(error).map_err(|e| {
                        ProtocolError::InvalidJson {
                            message: e.to_string(),
                        }
                    })?;
                }
                if let Some(seq) = seq {
                    obj["seq"] = (*seq).into();
                }
                if let Some(done) = done {
                    obj["done"] = (*done).into();
                }
                obj
            }
            Frame::Event(event) => {
                let mut obj = serde_json::json!({
                    "type": "evt",
                    "event": event.event,
                });
                if let Some(seq) = event.seq {
                    obj["seq"] = seq.into();
                }
                if let Some(payload) = &event.payload {
                    obj["payload"] = payload.clone();
                }
                obj
            }
        };

        serde_json::to_string(&value).map_err(|e| ProtocolError::InvalidJson {
            message: e.to_string(),
        })
    }
}

/// Client descriptor sent in the connect handshake.
///
/// The gateway schema is closed (`additionalProperties: false`), so only the
/// fields below may appear.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Stable client identifier registered with the gateway.
    pub id: String,
    /// Client semantic version.
    pub version: String,
    /// Operating system family.
    pub platform: String,
    /// Operating mode, one of the gateway's fixed set.
    pub mode: String,
}

/// Auth credential carried in the connect handshake.
#[derive(Debug, Clone, Serialize)]
pub struct AuthInfo {
    /// Bearer token.
    pub token: String,
}

/// Parameters of the `connect` request, the first frame on every session.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectParams {
    /// Lowest protocol version this client accepts.
    #[serde(rename = "minProtocol")]
    pub min_protocol: i64,
    /// Highest protocol version this client accepts.
    #[serde(rename = "maxProtocol")]
    pub max_protocol: i64,
    /// Client descriptor.
    pub client: ClientInfo,
    /// Requested role.
    pub role: String,
    /// Requested capability scopes.
    pub scopes: Vec<String>,
    /// Optional capability flags; omitted when empty.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub caps: Vec<String>,
    /// Auth credential.
    pub auth: AuthInfo,
    /// BCP 47 locale tag.
    pub locale: String,
    /// User-agent string for gateway logs.
    #[serde(rename = "userAgent")]
    pub user_agent: String,
}

/// Acceptance payload carried by a successful connect response.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Acceptance marker; the gateway sends `"hello-ok"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Negotiated protocol version.
    #[serde(default)]
    pub protocol: Option<i64>,
    /// Opaque session metadata.
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
}

impl HelloPayload {
    /// Whether this payload marks handshake acceptance.
    pub fn is_accepted(&self) -> bool {
        self.kind == "hello-ok"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_frame() {
        let json = r#"{"type":"res","id":"req-123","ok":true,"payload":{"data":"test"}}"#;
        match Frame::parse(json).unwrap() {
            Frame::Response { id, ok, .. } => {
                assert_eq!(id, "req-123");
                assert!(ok);
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_partial_response_frame() {
        let json = r#"{"type":"res","id":"r1","ok":true,"seq":2,"done":false,"payload":{"text":"par"}}"#;
        match Frame::parse(json).unwrap() {
            Frame::Response { seq, done, .. } => {
                assert_eq!(seq, Some(2));
                assert_eq!(done, Some(false));
            }
            other => panic!("expected response frame, got {other:?}"),
        }
    }

    #[test]
    fn parse_event_frame_both_spellings() {
        for kind in ["evt", "event"] {
            let json = format!(r#"{{"type":"{kind}","event":"chat","seq":1,"payload":{{}}}}"#);
            match Frame::parse(&json).unwrap() {
                Frame::Event(ev) => {
                    assert_eq!(ev.event, "chat");
                    assert_eq!(ev.seq, Some(1));
                }
                other => panic!("expected event frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn parse_rejects_invalid_json() {
        let result = Frame::parse(r#"{"type":"res", not json"#);
        assert!(matches!(result, Err(ProtocolError::InvalidJson { .. })));
    }

    #[test]
    fn parse_rejects_missing_type() {
        let result = Frame::parse(r#"{"id":"123","ok":true}"#);
        assert!(matches!(
            result,
            Err(ProtocolError::MissingField { field: "type" })
        ));
    }

    #[test]
    fn parse_rejects_unknown_type() {
        let result = Frame::parse(r#"{"type":"gossip"}"#);
        assert!(matches!(result, Err(ProtocolError::UnknownType { .. })));
    }

    #[test]
    fn request_ids_are_unique() {
        let a = Frame::request("echo", None);
        let b = Frame::request("echo", None);
        let (Frame::Request { id: id_a, .. }, Frame::Request { id: id_b, .. }) = (a, b) else {
            unreachable!()
        };
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn encode_request_roundtrips() {
        let frame = Frame::Request {
            id: "test-123".to_string(),
            method: "chat.send".to_string(),
            params: Some(serde_json::json!({"message": "hello"})),
        };
        let json = frame.encode().unwrap();
        assert!(json.contains(r#""type":"req""#));
        assert!(json.contains("test-123"));
        assert!(json.contains("chat.send"));

        match Frame::parse(&json).unwrap() {
            Frame::Request { id, method, .. } => {
                assert_eq!(id, "test-123");
                assert_eq!(method, "chat.send");
            }
            other => panic!("expected request frame, got {other:?}"),
        }
    }

    #[test]
    fn connect_params_use_wire_names() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "moltz-desktop".to_string(),
                version: "0.3.0".to_string(),
                platform: "linux".to_string(),
                mode: "ui".to_string(),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            caps: vec![],
            auth: AuthInfo {
                token: "test-token".to_string(),
            },
            locale: "en-US".to_string(),
            user_agent: "moltz/0.3.0".to_string(),
        };

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("minProtocol"));
        assert!(json.contains("maxProtocol"));
        assert!(json.contains("userAgent"));
        assert!(json.contains("operator.read"));
        // Empty caps must be omitted entirely; the gateway schema is closed.
        assert!(!json.contains("caps"));
    }

    #[test]
    fn hello_payload_acceptance() {
        let hello: HelloPayload =
            serde_json::from_str(r#"{"type":"hello-ok","protocol":3}"#).unwrap();
        assert!(hello.is_accepted());
        assert_eq!(hello.protocol, Some(3));

        let other: HelloPayload = serde_json::from_str(r#"{"type":"redirect"}"#).unwrap();
        assert!(!other.is_accepted());
    }

    #[test]
    fn error_detail_accepts_cause_alias() {
        let detail: ErrorDetail =
            serde_json::from_str(r#"{"cause":"auth-failed","message":"bad token"}"#).unwrap();
        assert_eq!(detail.code, "auth-failed");
    }
}

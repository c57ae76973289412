//! Wire protocol for the agent gateway.
//!
//! Every connected agent host holds one WebSocket. Each text frame carries a
//! single JSON [`Message`], discriminated by its `"type"` field. State
//! access (`GetState` / `SaveState`) is unary and travels over plain HTTP.

pub mod types;

pub use types::*;

use serde::{Deserialize, Serialize};

/// Wire protocol version, reported by `/health`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default deadline for a forwarded RPC call.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 30_000;
/// Interval between WebSocket pings sent to each host.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// A host silent for longer than this is treated as dead.
pub const LIVENESS_TIMEOUT_MS: u64 = 45_000;
/// Frames larger than this are rejected before decoding.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Machine-readable error codes used in unary responses.
pub mod error_codes {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const ETAG_MISMATCH: &str = "ETAG_MISMATCH";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

// ── Envelope ─────────────────────────────────────────────────────────────────

/// The streamed envelope: exactly one of seven kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Request(RpcRequest),
    Response(RpcResponse),
    Event(Event),
    RegisterAgentTypeRequest(RegisterAgentTypeRequest),
    RegisterAgentTypeResponse(RegisterAgentTypeResponse),
    AddSubscriptionRequest(AddSubscriptionRequest),
    AddSubscriptionResponse(AddSubscriptionResponse),
}

impl Message {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        if raw.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge {
                size: raw.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        serde_json::from_str(raw).map_err(ProtocolError::Decode)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::RegisterAgentTypeRequest(_) => "registerAgentTypeRequest",
            Self::RegisterAgentTypeResponse(_) => "registerAgentTypeResponse",
            Self::AddSubscriptionRequest(_) => "addSubscriptionRequest",
            Self::AddSubscriptionResponse(_) => "addSubscriptionResponse",
        }
    }
}

/// What can still be read from a frame that failed to decode: its declared
/// kind and correlation id, enough to send back a targeted error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHint {
    pub kind: String,
    pub request_id: String,
}

impl FrameHint {
    pub fn recover(raw: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let kind = value.get("type")?.as_str()?.to_string();
        let request_id = value.get("requestId")?.as_str()?.to_string();
        Some(Self { kind, request_id })
    }

    /// The error reply matching the hinted request kind, if it expects one.
    pub fn error_reply(&self, error: impl Into<String>) -> Option<Message> {
        let error = error.into();
        match self.kind.as_str() {
            "request" => Some(Message::Response(RpcResponse::err(&self.request_id, error))),
            "registerAgentTypeRequest" => {
                Some(Message::RegisterAgentTypeResponse(RegisterAgentTypeResponse {
                    request_id: self.request_id.clone(),
                    success: false,
                    error: Some(error),
                }))
            },
            "addSubscriptionRequest" => {
                Some(Message::AddSubscriptionResponse(AddSubscriptionResponse {
                    request_id: self.request_id.clone(),
                    success: false,
                    subscription_id: None,
                    error: Some(error),
                }))
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_shape() {
        let mut req = RpcRequest::new(
            "1",
            AgentId::new("echo", "a"),
            "ping",
            Payload::text("str", "hi"),
        );
        req.metadata.insert("trace".into(), "abc".into());
        let json: serde_json::Value =
            serde_json::from_str(&Message::Request(req).encode().unwrap()).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["requestId"], "1");
        assert_eq!(json["target"]["type"], "echo");
        assert_eq!(json["target"]["key"], "a");
        assert_eq!(json["payload"]["dataContentType"], "text/plain");
        assert_eq!(json["payload"]["data"], "aGk=");
        assert_eq!(json["metadata"]["trace"], "abc");
        assert!(json.get("source").is_none());
    }

    #[test]
    fn decodes_register_request() {
        let msg = Message::decode(
            r#"{"type":"registerAgentTypeRequest","requestId":"r1","agentType":"echo"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::RegisterAgentTypeRequest(RegisterAgentTypeRequest {
                request_id: "r1".into(),
                agent_type: "echo".into(),
            })
        );
    }

    #[test]
    fn decodes_prefix_subscription() {
        let msg = Message::decode(
            r#"{"type":"addSubscriptionRequest","requestId":"s1",
                "subscription":{"kind":"prefix","topicTypePrefix":"chat.","agentType":"b"}}"#,
        )
        .unwrap();
        let Message::AddSubscriptionRequest(req) = msg else {
            panic!("wrong variant");
        };
        assert_eq!(req.subscription, Subscription::prefix("chat.", "b"));
    }

    #[test]
    fn response_error_omitted_when_empty() {
        let raw = Message::Response(RpcResponse::ok("7", Payload::default()))
            .encode()
            .unwrap();
        assert!(!raw.contains("\"error\""));
        let raw = Message::Response(RpcResponse::err("7", "boom"))
            .encode()
            .unwrap();
        assert!(raw.contains("\"error\":\"boom\""));
    }

    #[test]
    fn event_without_recipients_decodes() {
        let msg = Message::decode(
            r#"{"type":"event","topicType":"news.sports","topicSource":"s1",
                "payload":{"dataType":"t","dataContentType":"application/json","data":"e30="}}"#,
        )
        .unwrap();
        let Message::Event(event) = msg else {
            panic!("wrong variant");
        };
        assert!(event.recipients.is_empty());
        assert_eq!(event.payload.data.as_slice(), b"{}");
        assert_eq!(event.topic(), TopicId::new("news.sports", "s1"));
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        let err = Message::decode(
            r#"{"type":"response","requestId":"1","payload":{"data":"***"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn state_data_keeps_variant() {
        for data in [
            AgentStateData::Binary(Blob(vec![0, 159, 255])),
            AgentStateData::Text("hello".into()),
            AgentStateData::Structured(serde_json::json!({"n": 1, "tags": ["a"]})),
        ] {
            let state = AgentState {
                agent_id: AgentId::new("t", "k"),
                etag: String::new(),
                data: data.clone(),
            };
            let back: AgentState =
                serde_json::from_str(&serde_json::to_string(&state).unwrap()).unwrap();
            assert_eq!(back.data, data);
        }
    }

    #[test]
    fn hint_recovers_request_id_from_invalid_request() {
        // target is missing, so full decoding fails
        let raw = r#"{"type":"request","requestId":"9","method":"ping"}"#;
        assert!(Message::decode(raw).is_err());
        let hint = FrameHint::recover(raw).unwrap();
        let Some(Message::Response(resp)) = hint.error_reply("bad request") else {
            panic!("expected response");
        };
        assert_eq!(resp.request_id, "9");
        assert!(resp.is_error());
    }

    #[test]
    fn hint_gives_no_reply_for_events() {
        let hint = FrameHint {
            kind: "event".into(),
            request_id: "x".into(),
        };
        assert!(hint.error_reply("nope").is_none());
    }
}

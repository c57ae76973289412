use std::{collections::HashMap, fmt};

use {
    base64::{Engine as _, engine::general_purpose::STANDARD},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

/// Free-form string metadata, forwarded verbatim.
pub type Metadata = HashMap<String, String>;

// ── Identifiers ──────────────────────────────────────────────────────────────

/// Address of one logical agent instance: `type` picks the hosting
/// connection, `key` picks the instance inside that host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    pub r#type: String,
    pub key: String,
}

impl AgentId {
    pub fn new(r#type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.key)
    }
}

/// A broadcast channel. `source` scopes the topic to an origin such as a
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId {
    pub r#type: String,
    pub source: String,
}

impl TopicId {
    pub fn new(r#type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            r#type: r#type.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.r#type, self.source)
    }
}

// ── Payload ──────────────────────────────────────────────────────────────────

/// Raw bytes carried as a base64 string on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Blob {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Blob)
            .map_err(serde::de::Error::custom)
    }
}

/// Opaque message body. The gateway never inspects or rewrites it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub data_content_type: String,
    #[serde(default)]
    pub data: Blob,
}

impl Payload {
    pub fn new(
        data_type: impl Into<String>,
        data_content_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            data_content_type: data_content_type.into(),
            data: Blob(data.into()),
        }
    }

    /// A UTF-8 text payload with `text/plain` content type.
    pub fn text(data_type: impl Into<String>, text: &str) -> Self {
        Self::new(data_type, "text/plain", text.as_bytes().to_vec())
    }
}

// ── RPC ──────────────────────────────────────────────────────────────────────

/// A point-to-point call addressed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AgentId>,
    pub target: AgentId,
    pub method: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl RpcRequest {
    pub fn new(
        request_id: impl Into<String>,
        target: AgentId,
        method: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            source: None,
            target,
            method: method.into(),
            payload,
            metadata: Metadata::new(),
        }
    }
}

/// The single terminal answer to an [`RpcRequest`]. A non-empty `error`
/// marks a failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: String,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl RpcResponse {
    pub fn ok(request_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            request_id: request_id.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn err(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            error: error.into(),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

/// A fire-and-forget broadcast on a topic.
///
/// `recipients` is empty when a host publishes. On delivery the gateway fills
/// it with the matched agent types hosted on the receiving connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub topic_type: String,
    pub topic_source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<AgentId>,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

impl Event {
    pub fn new(topic: &TopicId, payload: Payload) -> Self {
        Self {
            topic_type: topic.r#type.clone(),
            topic_source: topic.source.clone(),
            source: None,
            payload,
            metadata: Metadata::new(),
            recipients: Vec::new(),
        }
    }

    pub fn topic(&self) -> TopicId {
        TopicId::new(&self.topic_type, &self.topic_source)
    }
}

// ── Control messages ─────────────────────────────────────────────────────────

/// Routing rule: which agent type receives events on which topics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Subscription {
    /// Topic type must equal `topic_type`.
    Exact {
        topic_type: String,
        agent_type: String,
    },
    /// Topic type must start with `topic_type_prefix`.
    Prefix {
        topic_type_prefix: String,
        agent_type: String,
    },
}

impl Subscription {
    pub fn exact(topic_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self::Exact {
            topic_type: topic_type.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn prefix(topic_type_prefix: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self::Prefix {
            topic_type_prefix: topic_type_prefix.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn agent_type(&self) -> &str {
        match self {
            Self::Exact { agent_type, .. } | Self::Prefix { agent_type, .. } => agent_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentTypeRequest {
    pub request_id: String,
    pub agent_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentTypeResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSubscriptionRequest {
    pub request_id: String,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddSubscriptionResponse {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Agent state ──────────────────────────────────────────────────────────────

/// Persisted agent state body. Stored and returned as the variant it was
/// saved with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AgentStateData {
    Binary(Blob),
    Text(String),
    Structured(serde_json::Value),
}

impl AgentStateData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Binary(_) => "binary",
            Self::Text(_) => "text",
            Self::Structured(_) => "structured",
        }
    }
}

/// State row for one agent. On save, `etag` is the caller's expected
/// current version (empty to create).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_id: AgentId,
    #[serde(default)]
    pub etag: String,
    pub data: AgentStateData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStateResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_state: Option<AgentState>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStateResponse {
    pub success: bool,
    /// The new eTag after a successful save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// One of [`crate::error_codes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

use agentgate_protocol::{AgentId, error_codes};

/// Failures on the routing path. Each one is reported back to the caller as
/// an error response; none of them closes a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("unknown agent type: {0}")]
    UnknownType(String),
    #[error("agent type {0} is already registered by a live connection")]
    AlreadyRegistered(String),
    #[error("connection hosting agent type {0} was lost")]
    ConnectionLost(String),
    #[error("request {0} timed out")]
    Timeout(String),
    #[error("request id {0} is already in flight")]
    DuplicateRequest(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Failures of the agent state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("etag mismatch for {0}")]
    ETagMismatch(AgentId),
    #[error("no state stored for {0}")]
    NotFound(AgentId),
    #[error("state storage failed: {0}")]
    Storage(String),
}

impl StateError {
    /// Wire code reported in `SaveStateResponse.errorCode`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ETagMismatch(_) => error_codes::ETAG_MISMATCH,
            Self::NotFound(_) => error_codes::NOT_FOUND,
            Self::Storage(_) => error_codes::UNAVAILABLE,
        }
    }
}

impl From<sqlx::Error> for StateError {
    fn from(e: sqlx::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

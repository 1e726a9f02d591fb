//! Wire envelope types for host-agent communication.
//!
//! One JSON object per line in both directions:
//! - Host → worker: [`AgentRequest`] (`run`, `ping`)
//! - Worker → host: [`AgentResponse`] (`partial`*, then `final` or `pong`)

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id for one in-flight request.
///
/// UUID v4 when generated by the host; callers may supply their own for
/// correlation with an outer request id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests from host to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Run {
        id: RequestId,
        payload: Value,
        stream: bool,
    },

    Ping {
        id: RequestId,
    },
}

impl AgentRequest {
    pub fn id(&self) -> &RequestId {
        match self {
            Self::Run { id, .. } => id,
            Self::Ping { id } => id,
        }
    }
}

/// Response envelope from worker to host.
///
/// Decoded leniently: a missing id, a missing event, or an event kind this
/// host does not recognize are routing decisions for the dispatcher, not
/// decode failures. The worker protocol may grow event kinds before the
/// host learns about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub id: Option<RequestId>,
    #[serde(default)]
    pub event: Option<EventKind>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Intermediate streaming result. Never terminal.
    Partial,
    /// Terminal result for a `run` request.
    Final,
    /// Terminal reply to a `ping` request.
    Pong,
    /// Anything this host does not recognize.
    #[serde(other)]
    Unknown,
}

/// Progress notification delivered to the caller's progress channel.
///
/// For a single request id, `Partial` events arrive in emission order and
/// a `Final` event is always the last one delivered.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Partial,
    Final,
}

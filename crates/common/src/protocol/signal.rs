// Signal Bus message types.
//
// Every message is a flat JSON object `{ "type": ..., "sessionId": ..., ...fields }`.
// The same shape travels over the direct channel and the storage fallback.

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// A message published on the bus, stamped with the sending session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub signal: Signal,
}

impl SignalEnvelope {
    pub fn new(session_id: SessionId, signal: Signal) -> Self {
        Self { session_id, signal }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Type-specific payload of a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Signal {
    /// The current leader renewed its lease at `ts` (epoch millis).
    LeaderHeartbeat { ts: i64 },
    /// A resource changed server-side; peers should refetch.
    CacheInvalidate {
        resource_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resource_id: Option<String>,
    },
    /// The sender is editing `resource_key`.
    DraftLockAcquired { resource_key: String },
    /// The sender stopped editing `resource_key`.
    DraftLockReleased { resource_key: String },
}

impl Signal {
    /// Wire name of the message type.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LeaderHeartbeat { .. } => "LEADER_HEARTBEAT",
            Self::CacheInvalidate { .. } => "CACHE_INVALIDATE",
            Self::DraftLockAcquired { .. } => "DRAFT_LOCK_ACQUIRED",
            Self::DraftLockReleased { .. } => "DRAFT_LOCK_RELEASED",
        }
    }
}

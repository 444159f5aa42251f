// Lease Store record format.
//
// Stored as JSON `{ "holderId": "<session uuid>", "ts": <epoch millis> }`
// under the lease name.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Key of the leadership lease shared by all sessions of an origin.
pub const LEADER_LEASE_KEY: &str = "concord.leader";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub holder_id: SessionId,
    /// When the holder last claimed or renewed, in epoch milliseconds.
    pub ts: i64,
}

impl LeaseRecord {
    pub fn new(holder_id: SessionId, ts: i64) -> Self {
        Self { holder_id, ts }
    }

    /// Live while `now - ts < ttl`; anything older is abandoned.
    pub fn is_live_at(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms.saturating_sub(self.ts) < ttl_millis(ttl)
    }

    pub fn is_held_by(&self, session_id: SessionId) -> bool {
        self.holder_id == session_id
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_wire_shape_is_holder_and_ts() {
        let id = SessionId::generate();
        let record = LeaseRecord::new(id, 1_700_000_000_000);
        let value: serde_json::Value = serde_json::from_str(&record.encode().unwrap()).unwrap();
        assert_eq!(value["holderId"], id.to_string());
        assert_eq!(value["ts"], 1_700_000_000_000_i64);
        assert_eq!(LeaseRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }

    #[test]
    fn liveness_boundary_is_exclusive() {
        let ttl = Duration::from_millis(1_000);
        let record = LeaseRecord::new(SessionId::generate(), 10_000);
        assert!(record.is_live_at(10_999, ttl));
        assert!(!record.is_live_at(11_000, ttl));
    }

    #[test]
    fn holder_check_compares_session_ids() {
        let me = SessionId::generate();
        let record = LeaseRecord::new(me, 0);
        assert!(record.is_held_by(me));
        assert!(!record.is_held_by(SessionId::generate()));
    }
}

// HTTP header, route and error-envelope definitions shared by the record
// client and the server.

use serde::{Deserialize, Serialize};

/// Header carrying the caller's logical operation key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Set to `true` on responses served from the idempotency cache.
pub const IDEMPOTENCY_REPLAY_HEADER: &str = "idempotency-replay";

/// Actor identity forwarded by the authenticating proxy.
pub const ACTOR_ID_HEADER: &str = "x-actor-id";

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest idempotency key the server accepts.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

// ── Routes ─────────────────────────────────────────────────────────
pub const ROUTE_HEALTHZ: &str = "/healthz";
pub const ROUTE_RECORD: &str = "/v1/records/{resource_type}/{id}";
pub const ROUTE_RECORD_ENRICH: &str = "/v1/records/{resource_type}/{id}/enrich";
pub const ROUTE_IDEMPOTENCY_SWEEP: &str = "/v1/admin/idempotency/sweep";

/// Concrete path for a record.
pub fn record_path(resource_type: &str, id: &str) -> String {
    format!("/v1/records/{resource_type}/{id}")
}

/// Concrete path for a record's enrich operation.
pub fn enrich_path(resource_type: &str, id: &str) -> String {
    format!("/v1/records/{resource_type}/{id}/enrich")
}

/// Non-conflict error responses: `{ "error": { code, message, ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concrete_paths_match_route_templates() {
        let expected = ROUTE_RECORD
            .replace("{resource_type}", "note")
            .replace("{id}", "note123");
        assert_eq!(record_path("note", "note123"), expected);

        let expected = ROUTE_RECORD_ENRICH
            .replace("{resource_type}", "note")
            .replace("{id}", "note123");
        assert_eq!(enrich_path("note", "note123"), expected);
    }

    #[test]
    fn error_envelope_tolerates_missing_optional_fields() {
        let raw = r#"{"error":{"code":"NOT_FOUND","message":"record not found","retryable":false}}"#;
        let envelope: ErrorEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.error.code, "NOT_FOUND");
        assert!(envelope.error.request_id.is_none());
        assert!(envelope.error.details.is_none());
    }
}

// Core identity and record types shared across all Concord crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest actor identifier accepted from the identity provider.
pub const MAX_ACTOR_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("identifier contains control characters")]
    ControlCharacters,
    #[error("invalid session id: {0}")]
    InvalidSessionId(String),
}

/// Identifier of one session (one open window/tab) of an actor.
///
/// Generated once when the session starts and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|error| IdentifierError::InvalidSessionId(error.to_string()))
    }
}

/// Authenticated identity on whose behalf sessions act.
///
/// Issued by the external identity provider; Concord only validates its shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn parse(value: impl Into<String>) -> Result<Self, IdentifierError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if trimmed.len() > MAX_ACTOR_ID_LEN {
            return Err(IdentifierError::TooLong { max: MAX_ACTOR_ID_LEN });
        }
        if trimmed.chars().any(char::is_control) {
            return Err(IdentifierError::ControlCharacters);
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of the running session as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub actor_id: ActorId,
    pub session_id: SessionId,
}

impl SessionIdentity {
    /// Fresh identity for a session of `actor_id`.
    pub fn new(actor_id: ActorId) -> Self {
        Self { actor_id, session_id: SessionId::generate() }
    }
}

/// A mutable server resource guarded by an integer version counter.
///
/// `version` starts at 1 and is bumped exactly once per successful write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRecord {
    pub resource_type: String,
    pub id: String,
    pub version: i64,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `PUT /v1/records/{type}/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRecordRequest {
    pub data: serde_json::Value,
}

/// Body of `PATCH /v1/records/{type}/{id}`.
///
/// An omitted `baseVersion` is an explicit force save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub record: VersionedRecord,
}

/// Body of `POST /v1/records/{type}/{id}/enrich`.
///
/// Without `baseVersion` the enrichment applies to whatever version is current.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<i64>,
}

/// Result of an enrichment: the derived data and the record it was stored on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichResponse {
    pub enrichment: serde_json::Value,
    pub record: VersionedRecord,
}

/// Body of a 409 response for a stale `baseVersion`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    pub code: String,
    pub message: String,
    pub current_version: i64,
    pub current_record: VersionedRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn actor_id_is_trimmed_and_validated() {
        assert_eq!(ActorId::parse("  user-1 ").unwrap().as_str(), "user-1");
        assert_eq!(ActorId::parse("   "), Err(IdentifierError::Empty));
        assert_eq!(ActorId::parse("a\u{7}b"), Err(IdentifierError::ControlCharacters));
        assert_eq!(
            ActorId::parse("x".repeat(MAX_ACTOR_ID_LEN + 1)),
            Err(IdentifierError::TooLong { max: MAX_ACTOR_ID_LEN })
        );
    }

    #[test]
    fn session_id_parses_its_display_form() {
        let id = SessionId::generate();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<SessionId>().is_err());
    }

    #[test]
    fn fresh_identities_never_share_a_session_id() {
        let actor = ActorId::parse("user-1").unwrap();
        let a = SessionIdentity::new(actor.clone());
        let b = SessionIdentity::new(actor);
        assert_eq!(a.actor_id, b.actor_id);
        assert_ne!(a.session_id, b.session_id);
    }

    #[test]
    fn mutation_request_omits_missing_base_version() {
        let force = MutationRequest { base_version: None, data: json!({"body": "x"}) };
        assert_eq!(serde_json::to_value(&force).unwrap(), json!({"data": {"body": "x"}}));

        let guarded: MutationRequest =
            serde_json::from_value(json!({"baseVersion": 3, "data": {}})).unwrap();
        assert_eq!(guarded.base_version, Some(3));
    }

    #[test]
    fn conflict_body_uses_camel_case_fields() {
        let now = Utc::now();
        let body = ConflictBody {
            code: "VERSION_CONFLICT".into(),
            message: "stale".into(),
            current_version: 4,
            current_record: VersionedRecord {
                resource_type: "note".into(),
                id: "note123".into(),
                version: 4,
                data: json!({}),
                updated_by: None,
                created_at: now,
                updated_at: now,
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["currentVersion"], 4);
        assert_eq!(value["currentRecord"]["resourceType"], "note");
        assert!(value["currentRecord"].get("updatedBy").is_none());
    }
}

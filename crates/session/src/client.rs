// HTTP client for the Concord record API.
//
// Mutations carry `baseVersion`; a 409 decodes into a typed conflict holding
// the current record so the caller can reconcile without another round trip.
// Every successful mutation is announced to peer sessions.

use std::time::Duration;

use concord_common::protocol::http::{
    enrich_path, record_path, ErrorBody, ErrorEnvelope, ACTOR_ID_HEADER, IDEMPOTENCY_KEY_HEADER,
    IDEMPOTENCY_REPLAY_HEADER,
};
use concord_common::types::{
    ActorId, ConflictBody, CreateRecordRequest, EnrichRequest, EnrichResponse, MutationRequest,
    RecordEnvelope, VersionedRecord,
};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::invalidation::InvalidationRelay;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The write was based on a stale version.
    #[error("version conflict: record is at version {}", .0.current_version)]
    Conflict(Box<ConflictBody>),
    #[error("record not found")]
    NotFound,
    #[error("server returned {status}: {} ({})", .body.message, .body.code)]
    Api { status: u16, body: ErrorBody },
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// The server's current record, if this is a conflict.
    pub fn current_record(&self) -> Option<&VersionedRecord> {
        match self {
            Self::Conflict(body) => Some(&body.current_record),
            _ => None,
        }
    }
}

/// Outcome of an idempotent enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichOutcome {
    pub status: u16,
    pub response: EnrichResponse,
    /// Served from the server's idempotency cache.
    pub replayed: bool,
}

#[derive(Clone)]
pub struct RecordClient {
    http: Client,
    base_url: Url,
    actor_id: ActorId,
    relay: Option<InvalidationRelay>,
}

impl RecordClient {
    pub fn new(base_url: &str, actor_id: ActorId) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { http, base_url: Url::parse(base_url)?, actor_id, relay: None })
    }

    /// Announce successful mutations through `relay`.
    pub fn with_relay(mut self, relay: InvalidationRelay) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get(&self, resource_type: &str, id: &str) -> Result<VersionedRecord, ClientError> {
        let url = self.base_url.join(&record_path(resource_type, id))?;
        let response = self.http.get(url).header(ACTOR_ID_HEADER, self.actor_id.as_str()).send().await?;
        let envelope: RecordEnvelope = decode_success(response).await?;
        Ok(envelope.record)
    }

    pub async fn create(
        &self,
        resource_type: &str,
        id: &str,
        data: serde_json::Value,
    ) -> Result<VersionedRecord, ClientError> {
        let url = self.base_url.join(&record_path(resource_type, id))?;
        let response = self
            .http
            .put(url)
            .header(ACTOR_ID_HEADER, self.actor_id.as_str())
            .json(&CreateRecordRequest { data })
            .send()
            .await?;
        let envelope: RecordEnvelope = decode_success(response).await?;
        self.announce(resource_type, id);
        Ok(envelope.record)
    }

    /// Write `data` if the record is still at `base_version`. `None` forces
    /// the write regardless of the current version.
    pub async fn update(
        &self,
        resource_type: &str,
        id: &str,
        base_version: Option<i64>,
        data: serde_json::Value,
    ) -> Result<VersionedRecord, ClientError> {
        let url = self.base_url.join(&record_path(resource_type, id))?;
        let response = self
            .http
            .patch(url)
            .header(ACTOR_ID_HEADER, self.actor_id.as_str())
            .json(&MutationRequest { base_version, data })
            .send()
            .await?;
        let envelope: RecordEnvelope = decode_success(response).await.inspect_err(|error| {
            if let ClientError::Conflict(body) = error {
                debug!(
                    resource_type,
                    id,
                    ?base_version,
                    current_version = body.current_version,
                    "update rejected as stale"
                );
            }
        })?;
        self.announce(resource_type, id);
        Ok(envelope.record)
    }

    /// Run the server-side enrichment once per `idempotency_key`.
    pub async fn enrich(
        &self,
        resource_type: &str,
        id: &str,
        idempotency_key: &str,
        request: &EnrichRequest,
    ) -> Result<EnrichOutcome, ClientError> {
        let url = self.base_url.join(&enrich_path(resource_type, id))?;
        let response = self
            .http
            .post(url)
            .header(ACTOR_ID_HEADER, self.actor_id.as_str())
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(request)
            .send()
            .await?;

        let replayed = response
            .headers()
            .get(IDEMPOTENCY_REPLAY_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));
        let status = response.status().as_u16();
        let response: EnrichResponse = decode_success(response).await?;
        if !replayed {
            self.announce(resource_type, id);
        }
        Ok(EnrichOutcome { status, response, replayed })
    }

    fn announce(&self, resource_type: &str, id: &str) {
        if let Some(relay) = &self.relay {
            relay.notify_changed(resource_type, Some(id));
        }
    }
}

async fn decode_success<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if status.is_success() {
        return serde_json::from_slice(&bytes).map_err(|error| ClientError::Decode(error.to_string()));
    }
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound);
    }

    let value: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|error| ClientError::Decode(format!("status {status}: {error}")))?;

    if status == StatusCode::CONFLICT && value.get("currentVersion").is_some() {
        let conflict: ConflictBody =
            serde_json::from_value(value).map_err(|error| ClientError::Decode(error.to_string()))?;
        return Err(ClientError::Conflict(Box::new(conflict)));
    }

    match serde_json::from_value::<ErrorEnvelope>(value) {
        Ok(envelope) => Err(ClientError::Api { status: status.as_u16(), body: envelope.error }),
        Err(error) => {
            warn!(%status, error = %error, "unrecognized error response");
            Err(ClientError::Decode(format!("status {status}: {error}")))
        }
    }
}

// Record handlers: create, read, guarded update, and enrichment.

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use concord_common::types::{
    CreateRecordRequest, EnrichRequest, EnrichResponse, MutationRequest, RecordEnvelope,
    VersionedRecord,
};
use serde_json::json;
use tracing::info;

use super::{actor::Actor, ApiState};
use crate::enrich::with_enrichment;
use crate::error::{ApiError, ConflictResponse, ErrorCode};
use crate::guard::GuardError;

const MAX_SEGMENT_LEN: usize = 128;

/// Handler error: an API error envelope or a 409 with the current record.
#[derive(Debug)]
pub enum RecordApiError {
    Api(ApiError),
    Conflict(ConflictResponse),
}

impl From<ApiError> for RecordApiError {
    fn from(error: ApiError) -> Self {
        Self::Api(error)
    }
}

impl From<GuardError> for RecordApiError {
    fn from(error: GuardError) -> Self {
        match error {
            GuardError::Conflict { current, .. } => Self::Conflict(ConflictResponse { current: *current }),
            GuardError::NotFound { resource_type, id } => Self::Api(
                ApiError::from_code(ErrorCode::NotFound)
                    .with_details(json!({ "resource_type": resource_type, "id": id })),
            ),
            GuardError::AlreadyExists { resource_type, id } => Self::Api(
                ApiError::from_code(ErrorCode::RecordExists)
                    .with_details(json!({ "resource_type": resource_type, "id": id })),
            ),
            GuardError::Rejected(reason) => Self::Api(ApiError::new(ErrorCode::ValidationFailed, reason)),
            GuardError::Storage(error) => Self::Api(ApiError::internal(error)),
        }
    }
}

impl IntoResponse for RecordApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Api(error) => error.into_response(),
            Self::Conflict(conflict) => conflict.into_response(),
        }
    }
}

type RecordPath = Path<(String, String)>;

pub(super) async fn create_record(
    State(state): State<ApiState>,
    actor: Actor,
    Path((resource_type, id)): RecordPath,
    payload: Result<Json<CreateRecordRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RecordEnvelope>), RecordApiError> {
    validate_segments(&resource_type, &id)?;
    let Json(payload) = payload.map_err(invalid_json)?;

    let record = state.records.create(&resource_type, &id, payload.data, actor.as_str()).await?;
    Ok((StatusCode::CREATED, Json(RecordEnvelope { record })))
}

pub(super) async fn get_record(
    State(state): State<ApiState>,
    Path((resource_type, id)): RecordPath,
) -> Result<Json<RecordEnvelope>, RecordApiError> {
    validate_segments(&resource_type, &id)?;
    let record = state.records.get(&resource_type, &id).await?;
    Ok(Json(RecordEnvelope { record }))
}

pub(super) async fn update_record(
    State(state): State<ApiState>,
    actor: Actor,
    Path((resource_type, id)): RecordPath,
    payload: Result<Json<MutationRequest>, JsonRejection>,
) -> Result<Json<RecordEnvelope>, RecordApiError> {
    validate_segments(&resource_type, &id)?;
    let Json(payload) = payload.map_err(invalid_json)?;
    if payload.base_version.is_none() {
        info!(resource_type = %resource_type, id = %id, actor_id = actor.as_str(), "force save without base version");
    }

    let record = state
        .records
        .update(&resource_type, &id, payload.base_version, payload.data, actor.as_str())
        .await?;
    Ok(Json(RecordEnvelope { record }))
}

/// Compute the enrichment for the record as read, then store it only if the
/// record has not moved on in the meantime.
pub(super) async fn enrich_record(
    State(state): State<ApiState>,
    actor: Actor,
    Path((resource_type, id)): RecordPath,
    body: Bytes,
) -> Result<Json<EnrichResponse>, RecordApiError> {
    validate_segments(&resource_type, &id)?;
    let request: EnrichRequest = if body.iter().all(u8::is_ascii_whitespace) {
        EnrichRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|error| ApiError::new(ErrorCode::ValidationFailed, format!("invalid JSON body: {error}")))?
    };

    let current = state.records.get(&resource_type, &id).await?;
    if let Some(base_version) = request.base_version {
        if base_version != current.version {
            return Err(RecordApiError::Conflict(ConflictResponse { current }));
        }
    }
    if !current.data.is_object() {
        return Err(ApiError::new(ErrorCode::ValidationFailed, "record data must be a JSON object").into());
    }

    let source_version = current.version;
    let enrichment = compute_enrichment(&state, current).await?;
    let stored = enrichment.clone();
    let record = state
        .records
        .apply(&resource_type, &id, Some(source_version), actor.as_str(), move |locked| {
            with_enrichment(&locked.data, stored)
                .ok_or_else(|| GuardError::Rejected("record data must be a JSON object".into()))
        })
        .await?;

    info!(
        resource_type = %resource_type,
        id = %id,
        source_version,
        version = record.version,
        "record enriched"
    );
    Ok(Json(EnrichResponse { enrichment, record }))
}

async fn compute_enrichment(
    state: &ApiState,
    record: VersionedRecord,
) -> Result<serde_json::Value, RecordApiError> {
    let enricher = state.enricher.clone();
    let result = tokio::task::spawn_blocking(move || enricher.enrich(&record))
        .await
        .map_err(|error| ApiError::internal(anyhow::anyhow!("enrichment task failed: {error}")))?;
    result.map_err(|error| RecordApiError::Api(ApiError::internal(error)))
}

fn validate_segments(resource_type: &str, id: &str) -> Result<(), ApiError> {
    for (field, value) in [("resource_type", resource_type), ("id", id)] {
        let valid = !value.is_empty()
            && value.len() <= MAX_SEGMENT_LEN
            && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));
        if !valid {
            return Err(ApiError::new(ErrorCode::ValidationFailed, format!("invalid {field}"))
                .with_details(json!({ "field": field })));
        }
    }
    Ok(())
}

fn invalid_json(rejection: JsonRejection) -> ApiError {
    ApiError::new(ErrorCode::ValidationFailed, rejection.body_text())
}

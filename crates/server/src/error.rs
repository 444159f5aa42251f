use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use concord_common::protocol::http::REQUEST_ID_HEADER;
use concord_common::types::{ConflictBody, VersionedRecord};
use serde_json::{json, Value};
use uuid::Uuid;

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    ActorRequired,
    NotFound,
    RecordExists,
    VersionConflict,
    IdempotencyKeyReused,
    PayloadTooLarge,
    InternalError,
    StorageUnavailable,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ActorRequired => "ACTOR_REQUIRED",
            Self::NotFound => "NOT_FOUND",
            Self::RecordExists => "RECORD_EXISTS",
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::InternalError => "INTERNAL_ERROR",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::ActorRequired => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::RecordExists => StatusCode::CONFLICT,
            Self::VersionConflict => StatusCode::CONFLICT,
            Self::IdempotencyKeyReused => StatusCode::UNPROCESSABLE_ENTITY,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError | Self::StorageUnavailable)
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::ActorRequired => "missing or invalid x-actor-id header",
            Self::NotFound => "requested resource not found",
            Self::RecordExists => "record already exists",
            Self::VersionConflict => "record was modified by another session",
            Self::IdempotencyKeyReused => "idempotency key reused with a different request",
            Self::PayloadTooLarge => "payload exceeds maximum allowed size",
            Self::InternalError => "internal server error",
            Self::StorageUnavailable => "storage is temporarily unavailable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    details: Value,
    request_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}), request_id: None }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(default_code_for_status(status), message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Log `error` and hide it behind a generic 500.
    pub fn internal(error: anyhow::Error) -> Self {
        tracing::error!(error = ?error, "internal error");
        Self::from_code(ErrorCode::InternalError)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = self.request_id.or_else(current_request_id);

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                    "details": self.details,
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

/// 409 for a stale `baseVersion`, carrying the current record so the caller
/// can reconcile without a second round trip.
#[derive(Debug, Clone)]
pub struct ConflictResponse {
    pub current: VersionedRecord,
}

impl IntoResponse for ConflictResponse {
    fn into_response(self) -> Response {
        let body = ConflictBody {
            code: ErrorCode::VersionConflict.as_str().to_owned(),
            message: ErrorCode::VersionConflict.default_message().to_owned(),
            current_version: self.current.version,
            current_record: self.current,
        };
        let mut response = (StatusCode::CONFLICT, Json(body)).into_response();
        if let Some(request_id) = current_request_id() {
            attach_request_id_header(&mut response, &request_id);
        }
        response
    }
}

pub fn default_code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST => ErrorCode::ValidationFailed,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        StatusCode::CONFLICT => ErrorCode::RecordExists,
        StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::IdempotencyKeyReused,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::PayloadTooLarge,
        StatusCode::SERVICE_UNAVAILABLE => ErrorCode::StorageUnavailable,
        _ => ErrorCode::InternalError,
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}

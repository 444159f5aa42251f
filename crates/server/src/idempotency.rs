// Idempotency cache for operations submitted with an `Idempotency-Key`.
//
// Entries are scoped by `(key, actor)` and kept for a fixed retention window.
// Concurrent duplicates on one instance wait on a per-key gate, so the
// operation runs once. Across instances the unique `(key, actor)` constraint
// decides: the loser discards its own result and replays the winner's.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use axum::{
    body::{to_bytes, Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use concord_common::protocol::http::{
    ACTOR_ID_HEADER, IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER, MAX_IDEMPOTENCY_KEY_LEN,
};
use concord_common::types::ActorId;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{ApiError, ErrorCode};

/// Default retention for cached entries.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum request or response body buffered for hashing and caching (1 MiB).
const MAX_BUFFERED_BODY_BYTES: usize = 1024 * 1024;

/// Result of an operation as it is cached and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Server errors are not cached so that a retry runs the operation again.
    fn is_cacheable(&self) -> bool {
        self.status < 500
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentOutcome {
    pub response: CachedResponse,
    /// Served from the cache instead of running the operation.
    pub replayed: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency key `{key}` was already used for a different request")]
    KeyReused { key: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<sqlx::Error> for IdempotencyError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.into())
    }
}

type EntryKey = (String, String);

type GateRegistry = Arc<Mutex<HashMap<EntryKey, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Debug, Clone)]
struct StoredEntry {
    request_hash: String,
    response: CachedResponse,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
enum CacheBackend {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<EntryKey, StoredEntry>>>),
}

#[derive(Clone)]
pub struct IdempotencyCache {
    backend: CacheBackend,
    retention: Duration,
    gates: GateRegistry,
}

/// A caller's hold on a per-key gate. Dropping it unregisters the gate once
/// nobody else is waiting, also when the operation unwinds.
struct GateHandle {
    gates: GateRegistry,
    entry_key: EntryKey,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl GateHandle {
    fn acquire(gates: &GateRegistry, entry_key: EntryKey) -> Self {
        let gate = match gates.lock() {
            Ok(mut registry) => registry.entry(entry_key.clone()).or_default().clone(),
            // A poisoned registry only costs the in-process single flight.
            Err(_) => Arc::new(tokio::sync::Mutex::new(())),
        };
        Self { gates: gates.clone(), entry_key, gate }
    }
}

impl Drop for GateHandle {
    fn drop(&mut self) {
        if let Ok(mut registry) = self.gates.lock() {
            // Registry plus our handle: nobody else is waiting.
            if Arc::strong_count(&self.gate) <= 2 {
                registry.remove(&self.entry_key);
            }
        }
    }
}

enum InsertOutcome {
    Inserted,
    /// Another writer stored an entry for the same key first.
    Existing(StoredEntry),
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    request_hash: String,
    status: i32,
    content_type: Option<String>,
    body: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl From<EntryRow> for StoredEntry {
    fn from(row: EntryRow) -> Self {
        Self {
            request_hash: row.request_hash,
            response: CachedResponse {
                status: u16::try_from(row.status).unwrap_or(500),
                content_type: row.content_type,
                body: Bytes::from(row.body),
            },
            expires_at: row.expires_at,
        }
    }
}

impl IdempotencyCache {
    pub fn postgres(pool: PgPool) -> Self {
        Self::with_backend(CacheBackend::Postgres(pool))
    }

    pub fn memory() -> Self {
        Self::with_backend(CacheBackend::Memory(Arc::new(RwLock::new(HashMap::new()))))
    }

    fn with_backend(backend: CacheBackend) -> Self {
        Self { backend, retention: DEFAULT_RETENTION, gates: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Run `operation` at most once per live `(key, actor_id)` entry and
    /// return its response, or replay the stored one.
    pub async fn execute_idempotent<F, Fut>(
        &self,
        key: &str,
        actor_id: &str,
        request_hash: &str,
        operation: F,
    ) -> Result<IdempotentOutcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResponse>,
    {
        let handle = GateHandle::acquire(&self.gates, (key.to_owned(), actor_id.to_owned()));
        let _permit = handle.gate.lock().await;
        self.execute_gated(key, actor_id, request_hash, operation).await
    }

    async fn execute_gated<F, Fut>(
        &self,
        key: &str,
        actor_id: &str,
        request_hash: &str,
        operation: F,
    ) -> Result<IdempotentOutcome, IdempotencyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CachedResponse>,
    {
        if let Some(entry) = self.lookup(key, actor_id).await? {
            ensure_same_request(key, &entry, request_hash)?;
            debug!(idempotency_key = key, actor_id, status = entry.response.status, "idempotent replay");
            return Ok(IdempotentOutcome { response: entry.response, replayed: true });
        }

        let response = operation().await;
        if !response.is_cacheable() {
            warn!(idempotency_key = key, status = response.status, "operation failed, result not cached");
            return Ok(IdempotentOutcome { response, replayed: false });
        }

        match self.insert(key, actor_id, request_hash, &response).await? {
            InsertOutcome::Inserted => Ok(IdempotentOutcome { response, replayed: false }),
            InsertOutcome::Existing(winner) => {
                ensure_same_request(key, &winner, request_hash)?;
                info!(idempotency_key = key, actor_id, "lost idempotency race, adopting stored result");
                Ok(IdempotentOutcome { response: winner.response, replayed: true })
            }
        }
    }

    async fn lookup(&self, key: &str, actor_id: &str) -> Result<Option<StoredEntry>, IdempotencyError> {
        match &self.backend {
            CacheBackend::Memory(entries) => {
                let now = Utc::now();
                let entries = entries.read().await;
                Ok(entries
                    .get(&(key.to_owned(), actor_id.to_owned()))
                    .filter(|entry| entry.expires_at > now)
                    .cloned())
            }
            CacheBackend::Postgres(pool) => {
                let row = sqlx::query_as::<_, EntryRow>(
                    r#"
                    SELECT request_hash, status, content_type, body, expires_at
                    FROM idempotency_entries
                    WHERE idempotency_key = $1 AND actor_id = $2 AND expires_at > now()
                    "#,
                )
                .bind(key)
                .bind(actor_id)
                .fetch_optional(pool)
                .await?;
                Ok(row.map(StoredEntry::from))
            }
        }
    }

    async fn insert(
        &self,
        key: &str,
        actor_id: &str,
        request_hash: &str,
        response: &CachedResponse,
    ) -> Result<InsertOutcome, IdempotencyError> {
        let retention = chrono::Duration::from_std(self.retention)
            .context("idempotency retention out of range")?;

        match &self.backend {
            CacheBackend::Memory(entries) => {
                let now = Utc::now();
                let mut entries = entries.write().await;
                let entry_key = (key.to_owned(), actor_id.to_owned());
                if let Some(existing) = entries.get(&entry_key).filter(|entry| entry.expires_at > now) {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
                entries.insert(
                    entry_key,
                    StoredEntry {
                        request_hash: request_hash.to_owned(),
                        response: response.clone(),
                        expires_at: now + retention,
                    },
                );
                Ok(InsertOutcome::Inserted)
            }
            CacheBackend::Postgres(pool) => {
                // An expired entry for the key may be reused by a new operation.
                sqlx::query(
                    "DELETE FROM idempotency_entries \
                     WHERE idempotency_key = $1 AND actor_id = $2 AND expires_at <= now()",
                )
                .bind(key)
                .bind(actor_id)
                .execute(pool)
                .await?;

                let inserted = sqlx::query_scalar::<_, String>(
                    r#"
                    INSERT INTO idempotency_entries
                        (idempotency_key, actor_id, request_hash, status, content_type, body, expires_at)
                    VALUES ($1, $2, $3, $4, $5, $6, now() + make_interval(secs => $7))
                    ON CONFLICT (idempotency_key, actor_id) DO NOTHING
                    RETURNING idempotency_key
                    "#,
                )
                .bind(key)
                .bind(actor_id)
                .bind(request_hash)
                .bind(i32::from(response.status))
                .bind(response.content_type.as_deref())
                .bind(response.body.to_vec())
                .bind(self.retention.as_secs_f64())
                .fetch_optional(pool)
                .await?;

                if inserted.is_some() {
                    return Ok(InsertOutcome::Inserted);
                }
                match self.lookup(key, actor_id).await? {
                    Some(winner) => Ok(InsertOutcome::Existing(winner)),
                    // The winner expired in between; nothing left to adopt.
                    None => Ok(InsertOutcome::Inserted),
                }
            }
        }
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        match &self.backend {
            CacheBackend::Memory(entries) => {
                let now = Utc::now();
                let mut entries = entries.write().await;
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                Ok((before - entries.len()) as u64)
            }
            CacheBackend::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM idempotency_entries WHERE expires_at <= now()")
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected())
            }
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> Result<u64, IdempotencyError> {
        match &self.backend {
            CacheBackend::Memory(entries) => Ok(entries.read().await.len() as u64),
            CacheBackend::Postgres(pool) => {
                let count = sqlx::query_scalar::<_, i64>("SELECT count(*) FROM idempotency_entries")
                    .fetch_one(pool)
                    .await?;
                Ok(u64::try_from(count).unwrap_or(0))
            }
        }
    }

    /// Same storage, separate in-process gates: a second server instance.
    #[cfg(test)]
    fn replica(&self) -> Self {
        Self { backend: self.backend.clone(), retention: self.retention, gates: Default::default() }
    }
}

fn ensure_same_request(key: &str, entry: &StoredEntry, request_hash: &str) -> Result<(), IdempotencyError> {
    if entry.request_hash == request_hash {
        Ok(())
    } else {
        Err(IdempotencyError::KeyReused { key: key.to_owned() })
    }
}

/// SHA-256 over the method, path and body of a request.
pub fn request_fingerprint(method: &Method, path: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(path.as_bytes());
    hasher.update([0]);
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

fn validate_key(raw: &HeaderValue) -> Result<String, ApiError> {
    let key = raw
        .to_str()
        .map_err(|_| ApiError::new(ErrorCode::ValidationFailed, "idempotency key must be visible ASCII"))?
        .trim();
    if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ApiError::new(
            ErrorCode::ValidationFailed,
            format!("idempotency key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"),
        ));
    }
    Ok(key.to_owned())
}

/// Routes `POST` requests carrying `Idempotency-Key` through the cache.
///
/// Other requests pass through unchanged. Replays carry
/// `idempotency-replay: true`; every cached response echoes the key.
pub async fn idempotency_middleware(
    State(cache): State<IdempotencyCache>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::POST {
        return next.run(request).await;
    }
    let key = match request.headers().get(IDEMPOTENCY_KEY_HEADER) {
        None => return next.run(request).await,
        Some(raw) => match validate_key(raw) {
            Ok(key) => key,
            Err(error) => return error.into_response(),
        },
    };
    let actor = match request
        .headers()
        .get(ACTOR_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(ActorId::parse)
    {
        Some(Ok(actor)) => actor,
        _ => return ApiError::from_code(ErrorCode::ActorRequired).into_response(),
    };

    let (parts, body) = request.into_parts();
    let body_bytes = match to_bytes(body, MAX_BUFFERED_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return ApiError::new(
                ErrorCode::PayloadTooLarge,
                "request body too large for idempotency check",
            )
            .into_response();
        }
    };
    let request_hash = request_fingerprint(&parts.method, parts.uri.path(), &body_bytes);
    let request = Request::from_parts(parts, Body::from(body_bytes));

    let outcome = cache
        .execute_idempotent(&key, actor.as_str(), &request_hash, || async move {
            capture_response(next.run(request).await).await
        })
        .await;

    match outcome {
        Ok(outcome) => replayable_response(&key, outcome),
        Err(IdempotencyError::KeyReused { key }) => ApiError::from_code(ErrorCode::IdempotencyKeyReused)
            .with_details(json!({ "idempotency_key": key }))
            .into_response(),
        Err(IdempotencyError::Storage(error)) => {
            tracing::error!(error = ?error, idempotency_key = %key, "idempotency storage failed");
            ApiError::from_code(ErrorCode::StorageUnavailable).into_response()
        }
    }
}

async fn capture_response(response: Response) -> CachedResponse {
    let (parts, body) = response.into_parts();
    let content_type =
        parts.headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()).map(ToOwned::to_owned);
    match to_bytes(body, MAX_BUFFERED_BODY_BYTES).await {
        Ok(body) => CachedResponse { status: parts.status.as_u16(), content_type, body },
        Err(error) => {
            warn!(error = %error, "response too large to cache");
            CachedResponse {
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                content_type: Some("application/json".into()),
                body: Bytes::from(
                    json!({"error": {
                        "code": ErrorCode::InternalError.as_str(),
                        "message": "response too large to cache",
                        "retryable": true,
                    }})
                    .to_string(),
                ),
            }
        }
    }
}

fn replayable_response(key: &str, outcome: IdempotentOutcome) -> Response {
    let status =
        StatusCode::from_u16(outcome.response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Body::from(outcome.response.body)).into_response();
    let headers = response.headers_mut();
    if let Some(content_type) =
        outcome.response.content_type.as_deref().and_then(|value| HeaderValue::from_str(value).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(IDEMPOTENCY_KEY_HEADER, value);
    }
    if outcome.replayed {
        headers.insert(IDEMPOTENCY_REPLAY_HEADER, HeaderValue::from_static("true"));
    }
    response
}

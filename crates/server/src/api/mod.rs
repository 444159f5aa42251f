pub mod actor;
pub mod records;

use std::sync::Arc;

use axum::{
    extract::State,
    middleware,
    routing::{post, put},
    Json, Router,
};
use concord_common::protocol::http::{ROUTE_IDEMPOTENCY_SWEEP, ROUTE_RECORD, ROUTE_RECORD_ENRICH};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::enrich::Enricher;
use crate::error::{ApiError, ErrorCode};
use crate::guard::RecordStore;
use crate::idempotency::{idempotency_middleware, IdempotencyCache};

#[derive(Clone)]
pub struct ApiState {
    pub records: RecordStore,
    pub idempotency: IdempotencyCache,
    pub enricher: Arc<dyn Enricher>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SweepResponse {
    pub purged: u64,
}

/// Record API routes. Enrichment runs behind the idempotency cache.
pub fn router(state: ApiState) -> Router {
    let idempotency_layer =
        middleware::from_fn_with_state(state.idempotency.clone(), idempotency_middleware);

    Router::new()
        .route(
            ROUTE_RECORD,
            put(records::create_record).get(records::get_record).patch(records::update_record),
        )
        .route(ROUTE_RECORD_ENRICH, post(records::enrich_record).route_layer(idempotency_layer))
        .route(ROUTE_IDEMPOTENCY_SWEEP, post(sweep_idempotency))
        .with_state(state)
}

async fn sweep_idempotency(State(state): State<ApiState>) -> Result<Json<SweepResponse>, ApiError> {
    let purged = state.idempotency.purge_expired().await.map_err(|error| {
        tracing::error!(error = %error, "idempotency sweep failed");
        ApiError::from_code(ErrorCode::StorageUnavailable)
    })?;
    info!(purged, "idempotency sweep requested");
    Ok(Json(SweepResponse { purged }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::TextStatsEnricher;
    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        response::Response,
    };
    use concord_common::protocol::http::{
        enrich_path, record_path, ACTOR_ID_HEADER, IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER,
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_router() -> (Router, ApiState) {
        let state = ApiState {
            records: RecordStore::memory(),
            idempotency: IdempotencyCache::memory(),
            enricher: Arc::new(TextStatsEnricher),
        };
        (router(state.clone()), state)
    }

    fn json_request(method: Method, uri: &str, actor: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
        if let Some(actor) = actor {
            builder = builder.header(ACTOR_ID_HEADER, actor);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn read_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn seed(app: &Router) {
        let response = app
            .clone()
            .oneshot(json_request(
                Method::PUT,
                &record_path("note", "note123"),
                Some("user-a"),
                json!({"data": {"body": "first draft"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn create_then_get_returns_version_one() {
        let (app, _) = test_router();
        seed(&app).await;

        let response = app
            .oneshot(Request::builder().uri(record_path("note", "note123")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["record"]["version"], 1);
        assert_eq!(body["record"]["resourceType"], "note");
        assert_eq!(body["record"]["updatedBy"], "user-a");
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let (app, _) = test_router();
        seed(&app).await;
        let response = app
            .oneshot(json_request(Method::PUT, &record_path("note", "note123"), Some("user-b"), json!({"data": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(response).await["error"]["code"], "RECORD_EXISTS");
    }

    #[tokio::test]
    async fn stale_patch_returns_conflict_with_current_record() {
        let (app, _) = test_router();
        seed(&app).await;
        let path = record_path("note", "note123");

        let ok = app
            .clone()
            .oneshot(json_request(
                Method::PATCH,
                &path,
                Some("user-a"),
                json!({"baseVersion": 1, "data": {"body": "second"}}),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        assert_eq!(read_json(ok).await["record"]["version"], 2);

        let stale = app
            .oneshot(json_request(
                Method::PATCH,
                &path,
                Some("user-b"),
                json!({"baseVersion": 1, "data": {"body": "lost"}}),
            ))
            .await
            .unwrap();
        assert_eq!(stale.status(), StatusCode::CONFLICT);
        let body = read_json(stale).await;
        assert_eq!(body["code"], "VERSION_CONFLICT");
        assert_eq!(body["currentVersion"], 2);
        assert_eq!(body["currentRecord"]["data"]["body"], "second");
    }

    #[tokio::test]
    async fn patch_without_base_version_forces_save() {
        let (app, _) = test_router();
        seed(&app).await;
        let response = app
            .oneshot(json_request(
                Method::PATCH,
                &record_path("note", "note123"),
                Some("user-b"),
                json!({"data": {"body": "forced"}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["record"]["version"], 2);
    }

    #[tokio::test]
    async fn writes_require_actor_and_valid_json() {
        let (app, _) = test_router();
        let missing_actor = app
            .clone()
            .oneshot(json_request(Method::PUT, &record_path("note", "n1"), None, json!({"data": {}})))
            .await
            .unwrap();
        assert_eq!(missing_actor.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(missing_actor).await["error"]["code"], "ACTOR_REQUIRED");

        let bad_body = app
            .oneshot(json_request(Method::PUT, &record_path("note", "n1"), Some("user-a"), json!({"nope": 1})))
            .await
            .unwrap();
        assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);
        assert_eq!(read_json(bad_body).await["error"]["code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let (app, _) = test_router();
        let response = app
            .oneshot(Request::builder().uri(record_path("note", "absent")).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(read_json(response).await["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn enrich_stores_result_and_replays_duplicate() {
        let (app, state) = test_router();
        seed(&app).await;

        let request = || {
            let mut request =
                json_request(Method::POST, &enrich_path("note", "note123"), Some("user-a"), json!({"baseVersion": 1}));
            request.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, "note123:enrich".parse().unwrap());
            request
        };

        let first = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert!(first.headers().get(IDEMPOTENCY_REPLAY_HEADER).is_none());
        let first = read_json(first).await;
        assert_eq!(first["record"]["version"], 2);
        assert_eq!(first["enrichment"]["wordCount"], 2);
        assert_eq!(first["record"]["data"]["enrichment"]["sourceVersion"], 1);

        let second = app.oneshot(request()).await.unwrap();
        assert_eq!(second.headers().get(IDEMPOTENCY_REPLAY_HEADER).unwrap(), "true");
        assert_eq!(read_json(second).await, first);
        assert_eq!(state.records.get("note", "note123").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn enrich_with_stale_base_version_conflicts() {
        let (app, _) = test_router();
        seed(&app).await;
        let response = app
            .oneshot(json_request(
                Method::POST,
                &enrich_path("note", "note123"),
                Some("user-a"),
                json!({"baseVersion": 7}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(read_json(response).await["currentVersion"], 1);
    }

    #[tokio::test]
    async fn enrich_requires_object_data() {
        let (app, state) = test_router();
        state.records.create("note", "plain", json!("just text"), "user-a").await.unwrap();
        let response = app
            .oneshot(json_request(Method::POST, &enrich_path("note", "plain"), Some("user-a"), json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let state = ApiState {
            records: RecordStore::memory(),
            idempotency: IdempotencyCache::memory().with_retention(Duration::from_millis(1)),
            enricher: Arc::new(TextStatsEnricher),
        };
        let app = router(state.clone());
        seed(&app).await;

        let mut enrich = json_request(Method::POST, &enrich_path("note", "note123"), Some("user-a"), json!({}));
        enrich.headers_mut().insert(IDEMPOTENCY_KEY_HEADER, "k1".parse().unwrap());
        assert_eq!(app.clone().oneshot(enrich).await.unwrap().status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let response = app
            .oneshot(Request::builder().method(Method::POST).uri(ROUTE_IDEMPOTENCY_SWEEP).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(read_json(response).await["purged"], 1);
        assert_eq!(state.idempotency.len().await.unwrap(), 0);
    }
}

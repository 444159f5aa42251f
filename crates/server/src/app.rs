// Router assembly shared by the binary and integration tests.

use std::time::Instant;

use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use concord_common::protocol::http::ROUTE_HEALTHZ;
use tracing::{error, info};

use crate::api::{self, ApiState};
use crate::cors::cors_layer;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope, ApiError,
    ErrorCode,
};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Full server router: health check, record API, and the common middleware
/// stack. `cors_origins` is the raw `CONCORD_SERVER_CORS_ORIGINS` value.
pub fn build_app(state: ApiState, cors_origins: Option<&str>) -> Router {
    apply_middleware(
        Router::new().route(ROUTE_HEALTHZ, get(healthz)).merge(api::router(state)),
        cors_origins,
    )
}

fn apply_middleware(router: Router, cors_origins: Option<&str>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
        .layer(cors_layer(cors_origins))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            ApiError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

// CORS layer for browser sessions talking to the record server.
//
// Allowed origins come from `CONCORD_SERVER_CORS_ORIGINS` (comma-separated,
// or `*`). Without it only local development origins are allowed.

use axum::http::{HeaderName, HeaderValue, Method};
use concord_common::protocol::http::{
    ACTOR_ID_HEADER, IDEMPOTENCY_KEY_HEADER, IDEMPOTENCY_REPLAY_HEADER, REQUEST_ID_HEADER,
};
use tower_http::cors::{AllowOrigin, CorsLayer};

const DEFAULT_DEV_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://localhost:5173",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:5173",
];

/// Build the layer from `origins`, the raw `CONCORD_SERVER_CORS_ORIGINS`
/// value.
///
/// Browsers may send `Idempotency-Key` and `X-Actor-Id`, and may read the
/// request id and idempotency headers back. A wildcard origin disables
/// credentials.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
            HeaderName::from_static(ACTOR_ID_HEADER),
        ])
        .expose_headers([
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(IDEMPOTENCY_KEY_HEADER),
            HeaderName::from_static(IDEMPOTENCY_REPLAY_HEADER),
        ])
        .allow_credentials(true)
        .max_age(std::time::Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()).allow_credentials(false),
        Some(origins) => base.allow_origin(parse_origins(origins)),
        None => base.allow_origin(parse_origins(&DEFAULT_DEV_ORIGINS.join(","))),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}

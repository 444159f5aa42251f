use axum::{extract::FromRequestParts, http::request::Parts};
use concord_common::{protocol::http::ACTOR_ID_HEADER, types::ActorId};

use crate::error::{ApiError, ErrorCode};

/// Caller identity from `x-actor-id`, set by the authenticating proxy in
/// front of this server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor(pub ActorId);

impl Actor {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| ActorId::parse(value).ok())
            .map(Actor)
            .ok_or_else(|| ApiError::from_code(ErrorCode::ActorRequired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(request: Request<()>) -> Result<Actor, ApiError> {
        let (mut parts, ()) = request.into_parts();
        Actor::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn reads_trimmed_actor_header() {
        let request = Request::builder().header(ACTOR_ID_HEADER, " user-a ").body(()).unwrap();
        assert_eq!(extract(request).await.unwrap().as_str(), "user-a");
    }

    #[tokio::test]
    async fn missing_or_blank_actor_is_rejected() {
        let error = extract(Request::builder().body(()).unwrap()).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::ActorRequired);

        let blank = Request::builder().header(ACTOR_ID_HEADER, "  ").body(()).unwrap();
        assert_eq!(extract(blank).await.unwrap_err().code(), ErrorCode::ActorRequired);
    }
}

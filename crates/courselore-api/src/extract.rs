//! Request context extractors.
//!
//! Sign-in happens in front of this server; by the time a request arrives
//! the authenticated user id travels in [`USER_HEADER`].

use std::convert::Infallible;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use courselore_core::{ConnectionId, LIVE_CONNECTION_HEADER};

use crate::ApiError;

/// Header carrying the authenticated user's id.
pub const USER_HEADER: &str = "x-courselore-user";

/// The signed-in user making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(CurrentUser)
            .ok_or_else(|| ApiError::Unauthorized("Sign in required".to_string()))
    }
}

/// Live connection that issued the request, if the page sent one.
///
/// Malformed ids are treated as absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveOrigin(pub Option<ConnectionId>);

#[async_trait]
impl<S> FromRequestParts<S> for LiveOrigin
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let origin = parts
            .headers
            .get(LIVE_CONNECTION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<ConnectionId>().ok());
        Ok(LiveOrigin(origin))
    }
}

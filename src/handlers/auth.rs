//! Caller identity.
//!
//! Authentication happens upstream; the gateway forwards the verified user
//! id in the `x-user-id` header.

use crate::errors::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub i64);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(AuthenticatedUser)
            .ok_or_else(|| AppError::unauthenticated("missing or invalid user identity"))
    }
}

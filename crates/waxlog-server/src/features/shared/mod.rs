//! Shared utilities and types for feature modules
//!
//! Authentication is out of scope: the caller identifies itself with the
//! `x-user-id` header. Browsers cannot set headers on a WebSocket upgrade, so
//! a `user_id` query parameter is accepted as well.

use axum::{extract::FromRequestParts, http::request::Parts};
use uuid::Uuid;

use crate::error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

const USER_ID_QUERY: &str = "user_id";

/// The calling user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub Uuid);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let from_query = || {
            parts.uri.query().and_then(|query| {
                query.split('&').find_map(|pair| {
                    pair.strip_prefix(USER_ID_QUERY)
                        .and_then(|rest| rest.strip_prefix('='))
                        .map(str::to_string)
                })
            })
        };

        let raw = from_header
            .or_else(from_query)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_ID_HEADER} header")))?;

        Uuid::parse_str(raw.trim())
            .map(UserId)
            .map_err(|_| AppError::Unauthorized(format!("invalid {USER_ID_HEADER} '{raw}'")))
    }
}

//! Rate limit routes

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

use crate::error::AppResult;
use crate::features::shared::UserId;
use crate::sync::rate_limit::RateLimitStatus;
use crate::sync::RateLimiter;

pub fn rate_limit_routes() -> Router<RateLimiter> {
    Router::new()
        .route("/", get(get_rate_limit))
        .route("/reset", post(reset_rate_limit))
}

/// GET /rate-limit
async fn get_rate_limit(
    State(limiter): State<RateLimiter>,
    user: UserId,
) -> AppResult<Json<RateLimitStatus>> {
    Ok(Json(limiter.status(user.0).await?))
}

/// POST /rate-limit/reset, called after the user changes API credentials
async fn reset_rate_limit(State(limiter): State<RateLimiter>, user: UserId) -> AppResult<StatusCode> {
    limiter.reset(user.0).await?;
    Ok(StatusCode::NO_CONTENT)
}

//! Admin download routes

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use waxlog_common::types::MonthKey;

use crate::error::AppResult;
use crate::ingest::DownloadAdmin;

pub fn downloads_routes() -> Router<DownloadAdmin> {
    Router::new()
        .route("/status", get(status))
        .route("/trigger", post(trigger))
        .route("/reprocess", post(reprocess))
        .route("/reset", post(reset))
}

/// Body of the POST endpoints; the month defaults to the current one
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthRequest {
    pub month_key: Option<MonthKey>,
}

fn month_of(body: Option<Json<MonthRequest>>) -> Option<MonthKey> {
    body.and_then(|Json(request)| request.month_key)
}

/// GET /admin/downloads/status
async fn status(State(admin): State<DownloadAdmin>) -> AppResult<Response> {
    let records = admin.status().await?;
    Ok(Json(json!({ "records": records })).into_response())
}

/// POST /admin/downloads/trigger
async fn trigger(
    State(admin): State<DownloadAdmin>,
    body: Option<Json<MonthRequest>>,
) -> AppResult<Response> {
    let month = admin.trigger(month_of(body)).await;
    Ok((StatusCode::ACCEPTED, Json(json!({ "monthKey": month, "triggered": true }))).into_response())
}

/// POST /admin/downloads/reprocess
async fn reprocess(
    State(admin): State<DownloadAdmin>,
    body: Option<Json<MonthRequest>>,
) -> AppResult<Response> {
    let record = admin.reprocess(month_of(body)).await?;
    Ok((StatusCode::ACCEPTED, Json(record)).into_response())
}

/// POST /admin/downloads/reset
async fn reset(
    State(admin): State<DownloadAdmin>,
    body: Option<Json<MonthRequest>>,
) -> AppResult<Response> {
    let record = admin.reset(month_of(body)).await?;
    Ok((StatusCode::ACCEPTED, Json(record)).into_response())
}

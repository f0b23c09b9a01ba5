//! Sync routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::features::shared::UserId;
use crate::sync::orchestrator::DEFAULT_SESSION_LIST_LIMIT;
use crate::sync::{SyncOrchestrator, SyncSessionId, SyncStatus, SyncType};

const MAX_SESSION_LIST_LIMIT: i64 = 100;

pub fn sync_routes() -> Router<SyncOrchestrator> {
    Router::new()
        .route("/collection", post(initiate_sync))
        .route("/sessions", get(list_sessions))
        .route("/status/:session_id", get(get_status))
        .route("/:session_id/cancel", post(cancel_sync))
        .route("/:session_id/pause", post(pause_sync))
        .route("/:session_id/resume", post(resume_sync))
}

fn default_sync_type() -> SyncType {
    SyncType::Collection
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateSyncRequest {
    pub username: String,
    #[serde(default = "default_sync_type")]
    pub sync_type: SyncType,
    #[serde(default)]
    pub full_sync: bool,
    #[serde(default)]
    pub page_limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub session_id: SyncSessionId,
    pub status: SyncStatus,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<i64>,
}

/// POST /sync/collection
#[tracing::instrument(skip(orchestrator, request), fields(user_id = %user.0, sync_type = %request.sync_type))]
async fn initiate_sync(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Json(request): Json<InitiateSyncRequest>,
) -> AppResult<Response> {
    let session = orchestrator
        .initiate_sync(
            user.0,
            &request.username,
            request.sync_type,
            request.full_sync,
            request.page_limit,
        )
        .await?;

    let body = SessionStatusResponse {
        session_id: session.id,
        status: session.status,
    };
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

/// GET /sync/status/:session_id
async fn get_status(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Path(session_id): Path<String>,
) -> AppResult<Response> {
    let progress = orchestrator
        .get_sync_progress(user.0, session_id.parse()?)
        .await?;
    Ok(Json(progress).into_response())
}

/// GET /sync/sessions?limit=20
async fn list_sessions(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Query(query): Query<ListSessionsQuery>,
) -> AppResult<Response> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SESSION_LIST_LIMIT)
        .clamp(1, MAX_SESSION_LIST_LIMIT);
    let sessions = orchestrator.list_sessions(user.0, limit).await?;
    Ok(Json(sessions).into_response())
}

async fn cancel_sync(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionStatusResponse>> {
    let session = orchestrator.cancel_sync(user.0, session_id.parse()?).await?;
    Ok(Json(SessionStatusResponse {
        session_id: session.id,
        status: session.status,
    }))
}

async fn pause_sync(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionStatusResponse>> {
    let session = orchestrator.pause_sync(user.0, session_id.parse()?).await?;
    Ok(Json(SessionStatusResponse {
        session_id: session.id,
        status: session.status,
    }))
}

async fn resume_sync(
    State(orchestrator): State<SyncOrchestrator>,
    user: UserId,
    Path(session_id): Path<String>,
) -> AppResult<Json<SessionStatusResponse>> {
    let session = orchestrator.resume_sync(user.0, session_id.parse()?).await?;
    Ok(Json(SessionStatusResponse {
        session_id: session.id,
        status: session.status,
    }))
}

//! Persistence for sync sessions
//!
//! Status and progress are written separately. Status changes are a
//! compare-and-swap on the previous status; progress writes never touch the
//! status column, so a pause or cancel racing a page write is never undone.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::error::SyncError;
use super::models::{SyncSession, SyncSessionId, SyncStatus, SyncType};
use crate::db::is_unique_violation;

#[async_trait]
pub trait SyncSessionRepository: Send + Sync {
    /// Fails with [`SyncError::Conflict`] when the user already has an active
    /// session of the same type
    async fn insert(&self, session: &SyncSession) -> Result<(), SyncError>;

    async fn find_by_id(&self, id: SyncSessionId) -> Result<Option<SyncSession>, SyncError>;

    async fn find_active(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Option<SyncSession>, SyncError>;

    /// Newest first
    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncSession>, SyncError>;

    async fn find_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<SyncSession>, SyncError>;

    /// Persist status fields only if the stored status is still `expected`
    async fn update_status(
        &self,
        session: &SyncSession,
        expected: SyncStatus,
    ) -> Result<bool, SyncError>;

    /// Persist counters and cursor; never touches status
    async fn update_progress(&self, session: &SyncSession) -> Result<(), SyncError>;
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgSyncSessionRepository {
    pool: PgPool,
}

impl PgSyncSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    username: String,
    sync_type: String,
    status: String,
    full_sync: bool,
    page_limit: Option<i32>,
    total_requests: i32,
    completed_requests: i32,
    failed_requests: i32,
    items_synced: i64,
    next_page: i32,
    last_error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn non_negative<T: TryFrom<i64>>(value: i64, column: &str) -> Result<T, SyncError> {
    T::try_from(value).map_err(|_| SyncError::Corrupt(format!("{column} out of range: {value}")))
}

impl TryFrom<SessionRow> for SyncSession {
    type Error = SyncError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            user_id: row.user_id,
            username: row.username,
            sync_type: row
                .sync_type
                .parse()
                .map_err(|e: SyncError| SyncError::Corrupt(e.to_string()))?,
            status: row.status.parse()?,
            full_sync: row.full_sync,
            page_limit: row
                .page_limit
                .map(|v| non_negative(v.into(), "page_limit"))
                .transpose()?,
            total_requests: non_negative(row.total_requests.into(), "total_requests")?,
            completed_requests: non_negative(row.completed_requests.into(), "completed_requests")?,
            failed_requests: non_negative(row.failed_requests.into(), "failed_requests")?,
            items_synced: non_negative(row.items_synced, "items_synced")?,
            next_page: non_negative(row.next_page.into(), "next_page")?,
            last_error: row.last_error,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, username, sync_type, status, full_sync, page_limit,
           total_requests, completed_requests, failed_requests, items_synced, next_page,
           last_error, started_at, completed_at, created_at, updated_at
    FROM sync_sessions
"#;

fn collect(rows: Vec<SessionRow>) -> Result<Vec<SyncSession>, SyncError> {
    rows.into_iter().map(SyncSession::try_from).collect()
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl SyncSessionRepository for PgSyncSessionRepository {
    async fn insert(&self, session: &SyncSession) -> Result<(), SyncError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, user_id, username, sync_type, status, full_sync, page_limit,
                total_requests, completed_requests, failed_requests, items_synced, next_page,
                last_error, started_at, completed_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(session.user_id)
        .bind(&session.username)
        .bind(session.sync_type.as_str())
        .bind(session.status.as_str())
        .bind(session.full_sync)
        .bind(session.page_limit.map(to_i32))
        .bind(to_i32(session.total_requests))
        .bind(to_i32(session.completed_requests))
        .bind(to_i32(session.failed_requests))
        .bind(i64::try_from(session.items_synced).unwrap_or(i64::MAX))
        .bind(to_i32(session.next_page))
        .bind(&session.last_error)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(()),
            // The partial unique index on active sessions caught a concurrent initiate
            Err(e) if is_unique_violation(&e) => {
                let existing = self.find_active(session.user_id, session.sync_type).await?;
                Err(SyncError::Conflict {
                    sync_type: session.sync_type,
                    session_id: existing.map_or(session.id, |s| s.id),
                })
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn find_by_id(&self, id: SyncSessionId) -> Result<Option<SyncSession>, SyncError> {
        let row = sqlx::query_as::<_, SessionRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(SyncSession::try_from).transpose()
    }

    async fn find_active(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Option<SyncSession>, SyncError> {
        let active: Vec<&str> = SyncStatus::ACTIVE.iter().map(SyncStatus::as_str).collect();
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE user_id = $1 AND sync_type = $2 AND status = ANY($3) LIMIT 1",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .bind(sync_type.as_str())
        .bind(&active)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SyncSession::try_from).transpose()
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncSession>, SyncError> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            SELECT_COLUMNS
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn find_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<SyncSession>, SyncError> {
        let statuses: Vec<&str> = statuses.iter().map(SyncStatus::as_str).collect();
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "{} WHERE status = ANY($1) ORDER BY created_at",
            SELECT_COLUMNS
        ))
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;

        collect(rows)
    }

    async fn update_status(
        &self,
        session: &SyncSession,
        expected: SyncStatus,
    ) -> Result<bool, SyncError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_sessions
            SET status = $3,
                last_error = $4,
                started_at = $5,
                completed_at = $6,
                updated_at = $7
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(expected.as_str())
        .bind(session.status.as_str())
        .bind(&session.last_error)
        .bind(session.started_at)
        .bind(session.completed_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_progress(&self, session: &SyncSession) -> Result<(), SyncError> {
        sqlx::query(
            r#"
            UPDATE sync_sessions
            SET total_requests = $2,
                completed_requests = GREATEST(completed_requests, $3),
                failed_requests = GREATEST(failed_requests, $4),
                items_synced = GREATEST(items_synced, $5),
                next_page = $6,
                last_error = $7,
                updated_at = $8
            WHERE id = $1
            "#,
        )
        .bind(session.id.as_uuid())
        .bind(to_i32(session.total_requests))
        .bind(to_i32(session.completed_requests))
        .bind(to_i32(session.failed_requests))
        .bind(i64::try_from(session.items_synced).unwrap_or(i64::MAX))
        .bind(to_i32(session.next_page))
        .bind(&session.last_error)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemorySyncSessionRepository {
    sessions: RwLock<HashMap<SyncSessionId, SyncSession>>,
}

impl MemorySyncSessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncSessionRepository for MemorySyncSessionRepository {
    async fn insert(&self, session: &SyncSession) -> Result<(), SyncError> {
        let mut sessions = self.sessions.write().await;
        let existing = sessions.values().find(|s| {
            s.user_id == session.user_id && s.sync_type == session.sync_type && s.status.is_active()
        });
        if let Some(existing) = existing {
            return Err(SyncError::Conflict {
                sync_type: session.sync_type,
                session_id: existing.id,
            });
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: SyncSessionId) -> Result<Option<SyncSession>, SyncError> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn find_active(
        &self,
        user_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Option<SyncSession>, SyncError> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.user_id == user_id && s.sync_type == sync_type && s.status.is_active())
            .cloned())
    }

    async fn list_for_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncSession>, SyncError> {
        let mut found: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(found)
    }

    async fn find_by_status(&self, statuses: &[SyncStatus]) -> Result<Vec<SyncSession>, SyncError> {
        let mut found: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }

    async fn update_status(
        &self,
        session: &SyncSession,
        expected: SyncStatus,
    ) -> Result<bool, SyncError> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&session.id) {
            Some(stored) if stored.status == expected => {
                stored.status = session.status;
                stored.last_error = session.last_error.clone();
                stored.started_at = session.started_at;
                stored.completed_at = session.completed_at;
                stored.updated_at = session.updated_at;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn update_progress(&self, session: &SyncSession) -> Result<(), SyncError> {
        let mut sessions = self.sessions.write().await;
        let stored = sessions
            .get_mut(&session.id)
            .ok_or(SyncError::NotFound(session.id))?;
        stored.total_requests = session.total_requests;
        stored.completed_requests = stored.completed_requests.max(session.completed_requests);
        stored.failed_requests = stored.failed_requests.max(session.failed_requests);
        stored.items_synced = stored.items_synced.max(session.items_synced);
        stored.next_page = session.next_page;
        stored.last_error = session.last_error.clone();
        stored.updated_at = session.updated_at;
        Ok(())
    }
}

//! Per-user request budget against the external API
//!
//! State lives in a shared store rather than process memory so the budget
//! survives restarts and holds across replicas. A row is only meaningful until
//! its `window_reset`; after that it reads as a fresh window, and the purge
//! job deletes it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::error::SyncError;
use crate::ingest::scheduler::Job;

pub const RATE_LIMIT_HEADER: &str = "x-discogs-ratelimit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-discogs-ratelimit-remaining";

pub const PURGE_JOB_NAME: &str = "rate-limit-purge";

/// Requests allowed per window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitBudget {
    pub limit: i32,
    pub window: Duration,
}

impl RateLimitBudget {
    pub fn fresh(&self, now: DateTime<Utc>) -> RateLimitState {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60));
        RateLimitState {
            limit: self.limit,
            remaining: self.limit,
            window_reset: now + window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitState {
    pub limit: i32,
    pub remaining: i32,
    pub window_reset: DateTime<Utc>,
}

/// Outcome of [`RateLimiter::check_and_reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub recommended_delay: Duration,
}

impl RateLimitState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_reset
    }

    /// The stored state, or a fresh window if there is none or it ran out
    pub fn current(stored: Option<Self>, budget: RateLimitBudget, now: DateTime<Utc>) -> Self {
        match stored {
            Some(state) if !state.is_expired(now) => state,
            _ => budget.fresh(now),
        }
    }

    pub fn recommended_delay(&self, now: DateTime<Utc>) -> Duration {
        if self.remaining > 0 {
            return Duration::ZERO;
        }
        (self.window_reset - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn reserve(&mut self, now: DateTime<Utc>) -> RateDecision {
        if self.remaining > 0 {
            self.remaining -= 1;
            RateDecision {
                allowed: true,
                recommended_delay: Duration::ZERO,
            }
        } else {
            RateDecision {
                allowed: false,
                recommended_delay: self.recommended_delay(now),
            }
        }
    }

    /// Fold in what the API reported; this only ever tightens the budget
    pub fn observe(&mut self, limit: Option<i32>, remaining: Option<i32>) {
        if let Some(limit) = limit.filter(|l| *l > 0) {
            self.limit = limit;
        }
        let mut next = self.remaining.min(self.limit);
        if let Some(reported) = remaining {
            next = next.min(reported);
        }
        self.remaining = next.max(0);
    }
}

/// Shared storage for [`RateLimitState`], one row per user
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn load(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<RateLimitState>, SyncError>;

    async fn reserve(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, SyncError>;

    async fn observe(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        limit: Option<i32>,
        remaining: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitState, SyncError>;

    async fn delete(&self, user_id: Uuid) -> Result<(), SyncError>;

    /// Drop rows whose window has passed
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, SyncError>;
}

// ============================================================================
// Postgres
// ============================================================================

pub struct PgRateLimitStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct StateRow {
    request_limit: i32,
    remaining: i32,
    window_reset: DateTime<Utc>,
}

impl From<StateRow> for RateLimitState {
    fn from(row: StateRow) -> Self {
        Self {
            limit: row.request_limit,
            remaining: row.remaining,
            window_reset: row.window_reset,
        }
    }
}

impl PgRateLimitStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Lock the user's row, let `apply` change it, write it back
    async fn with_row<T>(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut RateLimitState) -> T + Send,
    ) -> Result<T, SyncError> {
        let mut tx = self.pool.begin().await?;
        let fresh = budget.fresh(now);

        // Make sure there is a row to lock
        sqlx::query(
            r#"
            INSERT INTO rate_limit_state (user_id, request_limit, remaining, window_reset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(fresh.limit)
        .bind(fresh.remaining)
        .bind(fresh.window_reset)
        .execute(&mut *tx)
        .await?;

        let stored = sqlx::query_as::<_, StateRow>(
            "SELECT request_limit, remaining, window_reset FROM rate_limit_state WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .map(RateLimitState::from);

        let mut state = RateLimitState::current(stored, budget, now);
        let result = apply(&mut state);

        sqlx::query(
            r#"
            UPDATE rate_limit_state
            SET request_limit = $2, remaining = $3, window_reset = $4, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(state.limit)
        .bind(state.remaining)
        .bind(state.window_reset)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result)
    }
}

#[async_trait]
impl RateLimitStore for PgRateLimitStore {
    async fn load(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<RateLimitState>, SyncError> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT request_limit, remaining, window_reset FROM rate_limit_state WHERE user_id = $1 AND window_reset > $2",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(RateLimitState::from))
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, SyncError> {
        self.with_row(user_id, budget, now, |state| state.reserve(now)).await
    }

    async fn observe(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        limit: Option<i32>,
        remaining: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitState, SyncError> {
        self.with_row(user_id, budget, now, |state| {
            state.observe(limit, remaining);
            *state
        })
        .await
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), SyncError> {
        sqlx::query("DELETE FROM rate_limit_state WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, SyncError> {
        let result = sqlx::query("DELETE FROM rate_limit_state WHERE window_reset <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// Single-process store for tests and local development
#[derive(Default)]
pub struct MemoryRateLimitStore {
    states: Mutex<HashMap<Uuid, RateLimitState>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_row<T>(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut RateLimitState) -> T,
    ) -> T {
        let mut states = self.states.lock().await;
        let mut state = RateLimitState::current(states.get(&user_id).copied(), budget, now);
        let result = apply(&mut state);
        states.insert(user_id, state);
        result
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn load(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<Option<RateLimitState>, SyncError> {
        Ok(self
            .states
            .lock()
            .await
            .get(&user_id)
            .copied()
            .filter(|s| !s.is_expired(now)))
    }

    async fn reserve(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, SyncError> {
        Ok(self.with_row(user_id, budget, now, |state| state.reserve(now)).await)
    }

    async fn observe(
        &self,
        user_id: Uuid,
        budget: RateLimitBudget,
        limit: Option<i32>,
        remaining: Option<i32>,
        now: DateTime<Utc>,
    ) -> Result<RateLimitState, SyncError> {
        Ok(self
            .with_row(user_id, budget, now, |state| {
                state.observe(limit, remaining);
                *state
            })
            .await)
    }

    async fn delete(&self, user_id: Uuid) -> Result<(), SyncError> {
        self.states.lock().await.remove(&user_id);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, SyncError> {
        let mut states = self.states.lock().await;
        let before = states.len();
        states.retain(|_, s| !s.is_expired(now));
        Ok((before - states.len()) as u64)
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Answer for `GET /rate-limit`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub remaining: i32,
    pub limit: i32,
    pub window_reset: DateTime<Utc>,
    pub recommended_delay_ms: u64,
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    budget: RateLimitBudget,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, budget: RateLimitBudget) -> Self {
        Self { store, budget }
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    pub async fn check_and_reserve(&self, user_id: Uuid) -> Result<RateDecision, SyncError> {
        self.check_and_reserve_at(user_id, Utc::now()).await
    }

    pub async fn check_and_reserve_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, SyncError> {
        let decision = self.store.reserve(user_id, self.budget, now).await?;
        if !decision.allowed {
            debug!(
                user_id = %user_id,
                delay_ms = decision.recommended_delay.as_millis() as u64,
                "Rate limit reached"
            );
        }
        Ok(decision)
    }

    pub async fn status(&self, user_id: Uuid) -> Result<RateLimitStatus, SyncError> {
        self.status_at(user_id, Utc::now()).await
    }

    pub async fn status_at(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<RateLimitStatus, SyncError> {
        let stored = self.store.load(user_id, now).await?;
        let state = RateLimitState::current(stored, self.budget, now);
        Ok(RateLimitStatus {
            remaining: state.remaining,
            limit: state.limit,
            window_reset: state.window_reset,
            recommended_delay_ms: state.recommended_delay(now).as_millis() as u64,
        })
    }

    /// Forget the user's window, e.g. after they change API credentials
    pub async fn reset(&self, user_id: Uuid) -> Result<(), SyncError> {
        self.store.delete(user_id).await?;
        info!(user_id = %user_id, "Rate limit reset");
        Ok(())
    }

    /// Tighten the budget from the API's rate limit response headers
    pub async fn observe_headers(
        &self,
        user_id: Uuid,
        headers: &HashMap<String, String>,
    ) -> Result<(), SyncError> {
        let header = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .and_then(|(_, v)| v.trim().parse::<i32>().ok())
        };
        let limit = header(RATE_LIMIT_HEADER);
        let remaining = header(RATE_LIMIT_REMAINING_HEADER);
        if limit.is_none() && remaining.is_none() {
            return Ok(());
        }
        self.store
            .observe(user_id, self.budget, limit, remaining, Utc::now())
            .await?;
        Ok(())
    }

    /// The API said 429: spend whatever is left of this window
    pub async fn exhaust(&self, user_id: Uuid) -> Result<(), SyncError> {
        self.store
            .observe(user_id, self.budget, None, Some(0), Utc::now())
            .await?;
        Ok(())
    }
}

/// Scheduled cleanup of expired rate limit rows
pub struct RateLimitPurgeJob {
    store: Arc<dyn RateLimitStore>,
}

impl RateLimitPurgeJob {
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Job for RateLimitPurgeJob {
    fn name(&self) -> &'static str {
        PURGE_JOB_NAME
    }

    async fn run(&self) -> anyhow::Result<()> {
        let purged = self.store.purge_expired(Utc::now()).await?;
        if purged > 0 {
            debug!(purged, "Purged expired rate limit windows");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(limit: i32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            RateLimitBudget {
                limit,
                window: Duration::from_secs(60),
            },
        )
    }

    #[tokio::test]
    async fn test_budget_runs_out_then_resets_with_window() {
        let limiter = limiter(3);
        let user = Uuid::new_v4();
        let start = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check_and_reserve_at(user, start).await.unwrap().allowed);
        }
        let denied = limiter
            .check_and_reserve_at(user, start + chrono::Duration::seconds(20))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.recommended_delay, Duration::from_secs(40));

        let after = start + chrono::Duration::seconds(61);
        assert_eq!(limiter.status_at(user, after).await.unwrap().remaining, 3);
        assert!(limiter.check_and_reserve_at(user, after).await.unwrap().allowed);
        assert_eq!(limiter.status_at(user, after).await.unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_users_have_separate_budgets() {
        let limiter = limiter(1);
        let now = Utc::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(limiter.check_and_reserve_at(a, now).await.unwrap().allowed);
        assert!(!limiter.check_and_reserve_at(a, now).await.unwrap().allowed);
        assert!(limiter.check_and_reserve_at(b, now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reset_restores_full_budget() {
        let limiter = limiter(2);
        let user = Uuid::new_v4();
        limiter.check_and_reserve(user).await.unwrap();
        limiter.check_and_reserve(user).await.unwrap();
        assert!(!limiter.check_and_reserve(user).await.unwrap().allowed);

        limiter.reset(user).await.unwrap();
        assert!(limiter.check_and_reserve(user).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_headers_only_tighten() {
        let limiter = limiter(60);
        let user = Uuid::new_v4();
        limiter.check_and_reserve(user).await.unwrap();

        let headers = HashMap::from([
            ("X-Discogs-Ratelimit".to_string(), "60".to_string()),
            ("X-Discogs-Ratelimit-Remaining".to_string(), "12".to_string()),
        ]);
        limiter.observe_headers(user, &headers).await.unwrap();
        assert_eq!(limiter.status(user).await.unwrap().remaining, 12);

        let looser = HashMap::from([("x-discogs-ratelimit-remaining".to_string(), "50".to_string())]);
        limiter.observe_headers(user, &looser).await.unwrap();
        assert_eq!(limiter.status(user).await.unwrap().remaining, 12);

        limiter.exhaust(user).await.unwrap();
        let status = limiter.status(user).await.unwrap();
        assert_eq!(status.remaining, 0);
        assert!(status.recommended_delay_ms > 0);
    }

    #[test]
    fn test_observe_never_exceeds_limit() {
        let mut state = RateLimitBudget {
            limit: 60,
            window: Duration::from_secs(60),
        }
        .fresh(Utc::now());
        state.observe(Some(25), None);
        assert_eq!(state.limit, 25);
        assert_eq!(state.remaining, 25);
    }

    #[tokio::test]
    async fn test_purge_drops_expired_rows() {
        let store = MemoryRateLimitStore::new();
        let budget = RateLimitBudget {
            limit: 5,
            window: Duration::from_secs(60),
        };
        let now = Utc::now();
        store.reserve(Uuid::new_v4(), budget, now).await.unwrap();
        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
        assert_eq!(
            store.purge_expired(now + chrono::Duration::seconds(61)).await.unwrap(),
            1
        );
    }
}

//! Sync session orchestration
//!
//! Each active session is driven by one task that walks the listing page by
//! page: reserve a request from the rate limiter, relay the page request to
//! the user's browser, upsert the returned items, persist the cursor and push
//! a progress event. Pages are applied strictly in cursor order.
//!
//! The persisted status is the authority. Pause and cancel change it first
//! and then cancel the driver's token so a sleeping driver wakes up; a driver
//! that finds its session no longer Running simply returns.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::collection::{page_path, CollectionPage, CollectionStore};
use super::config::SyncConfig;
use super::error::SyncError;
use super::events::{ProgressEvent, ProgressEventKind, ProgressPublisher};
use super::models::{SyncProgress, SyncSession, SyncSessionId, SyncStatus, SyncType};
use super::rate_limit::RateLimiter;
use super::relay::{RelayRequest, RequestRelay};
use super::repository::SyncSessionRepository;

/// Sessions returned by [`SyncOrchestrator::list_sessions`]
pub const DEFAULT_SESSION_LIST_LIMIT: i64 = 20;

/// Longest wait between two attempts at the same page
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct Driver {
    id: Uuid,
    token: CancellationToken,
}

struct Inner {
    sessions: Arc<dyn SyncSessionRepository>,
    items: Arc<dyn CollectionStore>,
    limiter: RateLimiter,
    relay: RequestRelay,
    events: ProgressPublisher,
    config: SyncConfig,
    drivers: Mutex<HashMap<SyncSessionId, Driver>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

/// How a drive loop ended
#[derive(Debug, PartialEq, Eq)]
enum DriveEnd {
    Completed,
    /// Paused, cancelled, or shutting down
    Stopped,
}

impl SyncOrchestrator {
    pub fn new(
        sessions: Arc<dyn SyncSessionRepository>,
        items: Arc<dyn CollectionStore>,
        limiter: RateLimiter,
        relay: RequestRelay,
        events: ProgressPublisher,
        config: SyncConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions,
                items,
                limiter,
                relay,
                events,
                config,
                drivers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Create a Pending session and start driving it in the background
    pub async fn initiate_sync(
        &self,
        user_id: Uuid,
        username: &str,
        sync_type: SyncType,
        full_sync: bool,
        page_limit: Option<u32>,
    ) -> Result<SyncSession, SyncError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SyncError::Validation("username is required".to_string()));
        }
        if username.contains('/') {
            return Err(SyncError::Validation(format!("invalid username '{username}'")));
        }
        if page_limit == Some(0) {
            return Err(SyncError::Validation("pageLimit must be at least 1".to_string()));
        }

        let session = SyncSession::new(user_id, username, sync_type, full_sync, page_limit);
        self.inner.sessions.insert(&session).await?;

        info!(
            session_id = %session.id,
            user_id = %user_id,
            sync_type = %sync_type,
            full_sync,
            "Sync session created"
        );

        self.spawn_driver(session.clone()).await;
        Ok(session)
    }

    pub async fn pause_sync(&self, user_id: Uuid, id: SyncSessionId) -> Result<SyncSession, SyncError> {
        let mut session = self.owned_session(user_id, id).await?;
        self.transition(&mut session, SyncStatus::Paused).await?;
        self.stop_driver(id).await;
        info!(session_id = %id, cursor = session.next_page, "Sync paused");
        Ok(session)
    }

    pub async fn resume_sync(&self, user_id: Uuid, id: SyncSessionId) -> Result<SyncSession, SyncError> {
        let mut session = self.owned_session(user_id, id).await?;
        self.transition(&mut session, SyncStatus::Running).await?;
        info!(session_id = %id, cursor = session.next_page, "Sync resumed");
        self.spawn_driver(session.clone()).await;
        Ok(session)
    }

    pub async fn cancel_sync(&self, user_id: Uuid, id: SyncSessionId) -> Result<SyncSession, SyncError> {
        let mut session = self.owned_session(user_id, id).await?;
        self.transition(&mut session, SyncStatus::Cancelled).await?;
        self.stop_driver(id).await;
        info!(session_id = %id, "Sync cancelled");
        Ok(session)
    }

    pub async fn get_sync_progress(
        &self,
        user_id: Uuid,
        id: SyncSessionId,
    ) -> Result<SyncProgress, SyncError> {
        let session = self.owned_session(user_id, id).await?;
        Ok(session.progress(Utc::now()))
    }

    pub async fn list_sessions(&self, user_id: Uuid, limit: i64) -> Result<Vec<SyncProgress>, SyncError> {
        let now = Utc::now();
        Ok(self
            .inner
            .sessions
            .list_for_user(user_id, limit)
            .await?
            .iter()
            .map(|s| s.progress(now))
            .collect())
    }

    /// Park sessions a previous process left Pending or Running as Paused.
    /// Call once at startup, before any new session is driven.
    pub async fn recover_orphans(&self) -> Result<usize, SyncError> {
        let orphans = self
            .inner
            .sessions
            .find_by_status(&[SyncStatus::Pending, SyncStatus::Running])
            .await?;

        let mut recovered = 0;
        for mut session in orphans {
            if self.inner.drivers.lock().await.contains_key(&session.id) {
                continue;
            }
            let expected = session.status;
            session.suspend_orphan(Utc::now());
            if self.inner.sessions.update_status(&session, expected).await? {
                warn!(session_id = %session.id, user_id = %session.user_id, "Orphaned sync session paused");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Number of sessions with a live drive task
    pub async fn active_drivers(&self) -> usize {
        self.inner.drivers.lock().await.len()
    }

    /// A session that does not belong to `user_id` reads as missing
    async fn owned_session(&self, user_id: Uuid, id: SyncSessionId) -> Result<SyncSession, SyncError> {
        match self.inner.sessions.find_by_id(id).await? {
            Some(session) if session.user_id == user_id => Ok(session),
            _ => Err(SyncError::NotFound(id)),
        }
    }

    async fn transition(&self, session: &mut SyncSession, next: SyncStatus) -> Result<(), SyncError> {
        let expected = session.status;
        session.apply_transition(next, Utc::now())?;
        if !self.inner.sessions.update_status(session, expected).await? {
            return Err(SyncError::StaleSession {
                session_id: session.id,
                expected,
            });
        }
        Ok(())
    }

    async fn spawn_driver(&self, session: SyncSession) {
        let token = self.inner.shutdown.child_token();
        let driver_id = Uuid::new_v4();
        let id = session.id;

        if let Some(previous) = self.inner.drivers.lock().await.insert(
            id,
            Driver {
                id: driver_id,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(session, token).await;

            let mut drivers = orchestrator.inner.drivers.lock().await;
            if drivers.get(&id).map(|d| d.id) == Some(driver_id) {
                drivers.remove(&id);
            }
        });
    }

    async fn stop_driver(&self, id: SyncSessionId) {
        if let Some(driver) = self.inner.drivers.lock().await.remove(&id) {
            driver.token.cancel();
        }
    }

    async fn drive(&self, mut session: SyncSession, token: CancellationToken) {
        let id = session.id;
        let user_id = session.user_id;

        match self.run_session(&mut session, &token).await {
            Ok(DriveEnd::Completed) => {
                info!(
                    session_id = %id,
                    pages = session.completed_requests,
                    items = session.items_synced,
                    "Sync completed"
                );
                self.publish(ProgressEventKind::SyncComplete, &session, None);
            },
            Ok(DriveEnd::Stopped) => {
                debug!(session_id = %id, "Sync driver stopped");
            },
            Err(SyncError::StaleSession { .. }) => {
                debug!(session_id = %id, "Session changed underneath the driver");
            },
            Err(e) => {
                error!(session_id = %id, user_id = %user_id, error = %e, "Sync failed");
                session.last_error = Some(e.to_string());
                let expected = session.status;
                if session.apply_transition(SyncStatus::Failed, Utc::now()).is_ok() {
                    if let Err(persist) = self.inner.sessions.update_status(&session, expected).await {
                        error!(session_id = %id, error = %persist, "Could not record sync failure");
                    }
                }
                self.publish(ProgressEventKind::SyncError, &session, Some(e.to_string()));
            },
        }
    }

    async fn run_session(
        &self,
        session: &mut SyncSession,
        token: &CancellationToken,
    ) -> Result<DriveEnd, SyncError> {
        if session.status == SyncStatus::Pending {
            self.transition(session, SyncStatus::Running).await?;
        }

        let mut attempts = 0u32;
        loop {
            if token.is_cancelled() || !self.still_running(session.id).await? {
                return Ok(DriveEnd::Stopped);
            }

            let decision = self.inner.limiter.check_and_reserve(session.user_id).await?;
            if !decision.allowed {
                debug!(
                    session_id = %session.id,
                    delay_ms = decision.recommended_delay.as_millis() as u64,
                    "Waiting for rate limit window"
                );
                if !sleep_or_cancel(token, decision.recommended_delay).await {
                    return Ok(DriveEnd::Stopped);
                }
                continue;
            }

            let fetched = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(DriveEnd::Stopped),
                fetched = self.fetch_page(session) => fetched,
            };

            match fetched {
                Ok(page) => {
                    attempts = 0;
                    if let Some(end) = self.apply_page(session, page).await? {
                        return Ok(end);
                    }
                },
                Err(e) => {
                    attempts += 1;
                    session.record_failure(e.to_string());
                    self.inner.sessions.update_progress(session).await?;
                    warn!(
                        session_id = %session.id,
                        page = session.next_page,
                        attempt = attempts,
                        error = %e,
                        "Page request failed"
                    );

                    if attempts >= self.inner.config.max_retries {
                        return Err(SyncError::RetriesExhausted {
                            page: session.next_page,
                            attempts,
                            last_error: e.to_string(),
                        });
                    }
                    self.publish(ProgressEventKind::SyncProgress, session, Some(e.to_string()));
                    if !sleep_or_cancel(token, self.backoff(attempts)).await {
                        return Ok(DriveEnd::Stopped);
                    }
                },
            }
        }
    }

    /// Upsert a page and advance the cursor. Returns `Some` once the walk is over.
    async fn apply_page(
        &self,
        session: &mut SyncSession,
        page: CollectionPage,
    ) -> Result<Option<DriveEnd>, SyncError> {
        let outcome = self
            .inner
            .items
            .apply_page(session.user_id, session.sync_type, session.id, &page.items)
            .await?;

        session.record_page(page.pages, page.items.len() as u64);
        self.inner.sessions.update_progress(session).await?;
        debug!(
            session_id = %session.id,
            page = page.page,
            pages = page.pages,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "Page applied"
        );

        let reached_end = page.items.is_empty() || page.page >= page.pages;
        let caught_up = !session.full_sync && outcome.inserted == 0;
        if !(reached_end || caught_up || session.pages_exhausted()) {
            self.publish(ProgressEventKind::SyncProgress, session, None);
            return Ok(None);
        }

        // Only a full walk to the real last page knows what is gone
        if session.full_sync && reached_end {
            let pruned = self
                .inner
                .items
                .prune(session.user_id, session.sync_type, session.id)
                .await?;
            if pruned > 0 {
                info!(session_id = %session.id, pruned, "Removed items no longer listed");
            }
        }

        self.transition(session, SyncStatus::Completed).await?;
        Ok(Some(DriveEnd::Completed))
    }

    async fn fetch_page(&self, session: &SyncSession) -> Result<CollectionPage, SyncError> {
        let url = format!(
            "{}{}?page={}&per_page={}",
            self.inner.config.api_base_url.trim_end_matches('/'),
            page_path(session.sync_type, &session.username),
            session.next_page,
            self.inner.config.per_page
        );
        let response = self
            .inner
            .relay
            .dispatch(session.user_id, RelayRequest::get(url))
            .await?;

        self.inner
            .limiter
            .observe_headers(session.user_id, &response.headers)
            .await?;

        if response.status == 429 {
            self.inner.limiter.exhaust(session.user_id).await?;
            return Err(SyncError::Page("rate limited by the API (429)".to_string()));
        }
        if let Some(error) = response.error {
            return Err(SyncError::Page(error));
        }
        if !response.is_success() {
            return Err(SyncError::Page(format!("API answered HTTP {}", response.status)));
        }

        CollectionPage::from_json(session.sync_type, &response.body)
    }

    async fn still_running(&self, id: SyncSessionId) -> Result<bool, SyncError> {
        Ok(matches!(
            self.inner.sessions.find_by_id(id).await?,
            Some(stored) if stored.status == SyncStatus::Running
        ))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        self.inner
            .config
            .backoff_base()
            .saturating_mul(factor)
            .min(MAX_BACKOFF)
    }

    fn publish(&self, kind: ProgressEventKind, session: &SyncSession, message: Option<String>) {
        self.inner
            .events
            .publish(session.user_id, ProgressEvent::from_session(kind, session, message));
    }
}

/// False when `token` fired first
async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::collection::MemoryCollectionStore;
    use crate::sync::events::spawn_broadcaster;
    use crate::sync::rate_limit::{MemoryRateLimitStore, RateLimitBudget};
    use crate::sync::relay::{Envelope, RelayResponse, API_REQUEST};
    use crate::sync::repository::MemorySyncSessionRepository;
    use serde_json::{json, Value};

    struct Harness {
        orchestrator: SyncOrchestrator,
        sessions: Arc<MemorySyncSessionRepository>,
        items: Arc<MemoryCollectionStore>,
        limiter: RateLimiter,
        relay: RequestRelay,
    }

    fn harness(limit: i32) -> Harness {
        let sessions = Arc::new(MemorySyncSessionRepository::new());
        let items = Arc::new(MemoryCollectionStore::new());
        let limiter = RateLimiter::new(
            Arc::new(MemoryRateLimitStore::new()),
            RateLimitBudget {
                limit,
                window: Duration::from_secs(60),
            },
        );
        let relay = RequestRelay::new(Duration::from_secs(5));
        let (events, _) = spawn_broadcaster(relay.clone());
        let config = SyncConfig {
            api_base_url: "https://api.test".to_string(),
            max_retries: 3,
            backoff_base_ms: 1,
            ..SyncConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(
            sessions.clone(),
            items.clone(),
            limiter.clone(),
            relay.clone(),
            events,
            config,
            CancellationToken::new(),
        );
        Harness {
            orchestrator,
            sessions,
            items,
            limiter,
            relay,
        }
    }

    fn page_of(url: &str) -> u32 {
        url.split(['?', '&'])
            .find_map(|p| p.strip_prefix("page="))
            .and_then(|p| p.parse().ok())
            .unwrap_or(0)
    }

    /// Answers relayed requests like a browser would; `pages` holds instance ids per page
    async fn browser(relay: RequestRelay, user: Uuid, pages: Vec<Vec<i64>>) {
        let (_, mut outbound) = relay.register(user).await;
        tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                let Ok(envelope) = serde_json::from_str::<Envelope>(&frame) else {
                    continue;
                };
                if envelope.kind != API_REQUEST {
                    continue;
                }
                let request: RelayRequest = serde_json::from_value(envelope.payload).unwrap();
                let page = page_of(&request.url);
                let ids = pages.get(page as usize - 1).cloned().unwrap_or_default();
                let releases: Vec<Value> = ids
                    .iter()
                    .map(|id| json!({"id": id * 10, "instance_id": id, "folder_id": 1}))
                    .collect();
                relay
                    .resolve(RelayResponse {
                        request_id: request.request_id,
                        status: 200,
                        headers: HashMap::new(),
                        body: json!({
                            "pagination": {"page": page, "pages": pages.len()},
                            "releases": releases
                        }),
                        error: None,
                    })
                    .await;
            }
        });
    }

    async fn wait_for(
        sessions: &MemorySyncSessionRepository,
        id: SyncSessionId,
        done: impl Fn(&SyncSession) -> bool,
    ) -> SyncSession {
        for _ in 0..500 {
            let session = sessions.find_by_id(id).await.unwrap().unwrap();
            if done(&session) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached the expected state");
    }

    #[tokio::test]
    async fn test_full_sync_walks_every_page_and_prunes() {
        let h = harness(60);
        let user = Uuid::new_v4();

        // Left over from an earlier sync and no longer in the collection
        let stale = CollectionPage::from_json(
            SyncType::Collection,
            &json!({"pagination": {"page": 1, "pages": 1}, "releases": [{"id": 1, "instance_id": 999}]}),
        )
        .unwrap();
        h.items
            .apply_page(user, SyncType::Collection, SyncSessionId::new(), &stale.items)
            .await
            .unwrap();

        browser(h.relay.clone(), user, vec![vec![1, 2], vec![3, 4], vec![5]]).await;
        let session = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Collection, true, None)
            .await
            .unwrap();
        assert_eq!(session.status, SyncStatus::Pending);

        let done = wait_for(&h.sessions, session.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.completed_requests, 3);
        assert_eq!(done.total_requests, 3);
        assert_eq!(done.items_synced, 5);
        assert_eq!(done.next_page, 4);
        assert!(done.completed_at.is_some());

        assert_eq!(h.items.count(user, SyncType::Collection).await.unwrap(), 5);
        assert!(h.items.get(user, SyncType::Collection, 999).await.is_none());

        let progress = h.orchestrator.get_sync_progress(user, session.id).await.unwrap();
        assert_eq!(progress.percent_complete, 100.0);
    }

    #[tokio::test]
    async fn test_second_initiate_conflicts() {
        let h = harness(60);
        let user = Uuid::new_v4();
        // Connected but silent, so the first session stays Running
        let (_, _outbound) = h.relay.register(user).await;
        let first = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Wantlist, false, None)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Wantlist, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Conflict { session_id, .. } if session_id == first.id));
        assert_eq!(h.orchestrator.list_sessions(user, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_stops_when_page_adds_nothing() {
        let h = harness(60);
        let user = Uuid::new_v4();
        let known = CollectionPage::from_json(
            SyncType::Collection,
            &json!({"pagination": {"page": 1, "pages": 1}, "releases": [
                {"id": 30, "instance_id": 3}, {"id": 40, "instance_id": 4}
            ]}),
        )
        .unwrap();
        h.items
            .apply_page(user, SyncType::Collection, SyncSessionId::new(), &known.items)
            .await
            .unwrap();

        browser(h.relay.clone(), user, vec![vec![1, 2], vec![3, 4], vec![5, 6]]).await;
        let session = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Collection, false, None)
            .await
            .unwrap();

        let done = wait_for(&h.sessions, session.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.completed_requests, 2);
        assert_eq!(h.items.count(user, SyncType::Collection).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_page_limit_caps_total() {
        let h = harness(60);
        let user = Uuid::new_v4();
        browser(h.relay.clone(), user, vec![vec![1], vec![2], vec![3], vec![4]]).await;

        let session = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Collection, true, Some(2))
            .await
            .unwrap();
        let done = wait_for(&h.sessions, session.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.total_requests, 2);
        assert_eq!(done.completed_requests, 2);
    }

    #[tokio::test]
    async fn test_retries_exhaust_into_failed() {
        let h = harness(60);
        let user = Uuid::new_v4();
        let session = h
            .orchestrator
            .initiate_sync(user, "nobody-home", SyncType::Collection, false, None)
            .await
            .unwrap();

        let done = wait_for(&h.sessions, session.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, SyncStatus::Failed);
        assert_eq!(done.failed_requests, 3);
        assert_eq!(done.completed_requests, 0);
        assert!(done.last_error.unwrap().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn test_pause_keeps_cursor_and_resume_finishes() {
        // One request per window: page 1 goes through, page 2 waits
        let h = harness(1);
        let user = Uuid::new_v4();
        browser(h.relay.clone(), user, vec![vec![1], vec![2]]).await;

        let session = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Collection, true, None)
            .await
            .unwrap();
        wait_for(&h.sessions, session.id, |s| s.completed_requests == 1).await;

        let paused = h.orchestrator.pause_sync(user, session.id).await.unwrap();
        assert_eq!(paused.status, SyncStatus::Paused);
        assert_eq!(paused.next_page, 2);

        // Pausing twice is not a valid edge
        assert!(matches!(
            h.orchestrator.pause_sync(user, session.id).await,
            Err(SyncError::InvalidTransition { .. })
        ));

        h.limiter.reset(user).await.unwrap();
        h.orchestrator.resume_sync(user, session.id).await.unwrap();

        let done = wait_for(&h.sessions, session.id, |s| s.status.is_terminal()).await;
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.completed_requests, 2);
        assert_eq!(h.items.count(user, SyncType::Collection).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_driver() {
        let h = harness(1);
        let user = Uuid::new_v4();
        browser(h.relay.clone(), user, vec![vec![1], vec![2]]).await;

        let session = h
            .orchestrator
            .initiate_sync(user, "digger", SyncType::Collection, true, None)
            .await
            .unwrap();
        wait_for(&h.sessions, session.id, |s| s.completed_requests == 1).await;

        let cancelled = h.orchestrator.cancel_sync(user, session.id).await.unwrap();
        assert_eq!(cancelled.status, SyncStatus::Cancelled);
        assert!(h.orchestrator.resume_sync(user, session.id).await.is_err());

        for _ in 0..100 {
            if h.orchestrator.active_drivers().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.orchestrator.active_drivers().await, 0);
    }

    #[tokio::test]
    async fn test_other_users_cannot_touch_session() {
        let h = harness(1);
        let owner = Uuid::new_v4();
        let session = h
            .orchestrator
            .initiate_sync(owner, "digger", SyncType::Collection, true, None)
            .await
            .unwrap();

        let stranger = Uuid::new_v4();
        assert!(matches!(
            h.orchestrator.cancel_sync(stranger, session.id).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(h.orchestrator.get_sync_progress(stranger, session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_recover_orphans_pauses_dead_sessions() {
        let h = harness(60);
        let user = Uuid::new_v4();
        let mut running = SyncSession::new(user, "digger", SyncType::Collection, true, None);
        running.apply_transition(SyncStatus::Running, Utc::now()).unwrap();
        running.next_page = 7;
        h.sessions.insert(&running).await.unwrap();
        let pending = SyncSession::new(user, "digger", SyncType::Wantlist, true, None);
        h.sessions.insert(&pending).await.unwrap();

        assert_eq!(h.orchestrator.recover_orphans().await.unwrap(), 2);

        let stored = h.sessions.find_by_id(running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncStatus::Paused);
        assert_eq!(stored.next_page, 7);
        assert_eq!(h.orchestrator.recover_orphans().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_initiate_validates_input() {
        let h = harness(60);
        let user = Uuid::new_v4();
        assert!(matches!(
            h.orchestrator
                .initiate_sync(user, "  ", SyncType::Collection, true, None)
                .await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator
                .initiate_sync(user, "digger", SyncType::Collection, true, Some(0))
                .await,
            Err(SyncError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let h = harness(60);
        let config = SyncConfig {
            backoff_base_ms: 1_000,
            ..SyncConfig::default()
        };
        let orchestrator = SyncOrchestrator::new(
            h.sessions.clone(),
            h.items.clone(),
            h.limiter.clone(),
            h.relay.clone(),
            spawn_broadcaster(h.relay.clone()).0,
            config,
            CancellationToken::new(),
        );
        assert_eq!(orchestrator.backoff(1), Duration::from_secs(1));
        assert_eq!(orchestrator.backoff(3), Duration::from_secs(4));
        assert_eq!(orchestrator.backoff(20), MAX_BACKOFF);
    }
}

//! Sync session model
//!
//! ```text
//! Pending ──> Running ──> Completed
//!    │         │  ▲
//!    │         ▼  │
//!    │        Paused
//!    │         │
//!    └────> Cancelled / Failed
//! ```
//!
//! Pending may also go straight to Cancelled or Failed; Paused only resumes
//! or cancels. Completed, Failed and Cancelled are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncSessionId(Uuid);

impl SyncSessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SyncSessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SyncSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SyncSessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for SyncSessionId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::Validation(format!("invalid session id '{s}': {e}")))
    }
}

/// Which list of the user's account is synced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Collection,
    Wantlist,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Collection => "collection",
            SyncType::Wantlist => "wantlist",
        }
    }
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "collection" => Ok(SyncType::Collection),
            "wantlist" => Ok(SyncType::Wantlist),
            _ => Err(SyncError::Validation(format!("unknown sync type '{s}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    /// Statuses that block a second session of the same type
    pub const ACTIVE: [SyncStatus; 3] = [SyncStatus::Pending, SyncStatus::Running, SyncStatus::Paused];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Running => "running",
            SyncStatus::Paused => "paused",
            SyncStatus::Completed => "completed",
            SyncStatus::Failed => "failed",
            SyncStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncStatus::Completed | SyncStatus::Failed | SyncStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SyncStatus) -> bool {
        use SyncStatus::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled | Failed)
                | (Running, Paused | Completed | Failed | Cancelled)
                | (Paused, Running | Cancelled)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "running" => Ok(SyncStatus::Running),
            "paused" => Ok(SyncStatus::Paused),
            "completed" => Ok(SyncStatus::Completed),
            "failed" => Ok(SyncStatus::Failed),
            "cancelled" => Ok(SyncStatus::Cancelled),
            other => Err(SyncError::Corrupt(format!("unknown sync status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: SyncSessionId,
    pub user_id: Uuid,
    /// External account whose list is read
    pub username: String,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub full_sync: bool,
    pub page_limit: Option<u32>,
    /// Pages this session will request; 0 until the first page arrives
    pub total_requests: u32,
    pub completed_requests: u32,
    pub failed_requests: u32,
    pub items_synced: u64,
    /// 1-based page to request next
    pub next_page: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncSession {
    pub fn new(
        user_id: Uuid,
        username: impl Into<String>,
        sync_type: SyncType,
        full_sync: bool,
        page_limit: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SyncSessionId::new(),
            user_id,
            username: username.into(),
            sync_type,
            status: SyncStatus::Pending,
            full_sync,
            page_limit,
            total_requests: 0,
            completed_requests: 0,
            failed_requests: 0,
            items_synced: 0,
            next_page: 1,
            last_error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply_transition(&mut self, next: SyncStatus, now: DateTime<Utc>) -> Result<(), SyncError> {
        if !self.status.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == SyncStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Crash recovery: a session whose driver died is parked as Paused
    pub fn suspend_orphan(&mut self, now: DateTime<Utc>) {
        self.status = SyncStatus::Paused;
        self.updated_at = now;
    }

    /// Account for an applied page. `total_pages` is what the API reports.
    pub fn record_page(&mut self, total_pages: u32, items: u64) {
        let total = match self.page_limit {
            Some(limit) => total_pages.min(limit),
            None => total_pages,
        };
        self.total_requests = total.max(self.completed_requests + 1);
        self.completed_requests += 1;
        self.items_synced += items;
        self.next_page += 1;
        self.updated_at = Utc::now();
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.failed_requests += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Every page this session wants has been applied
    pub fn pages_exhausted(&self) -> bool {
        self.total_requests > 0 && self.completed_requests >= self.total_requests
    }

    pub fn progress(&self, now: DateTime<Utc>) -> SyncProgress {
        let percent_complete = if self.status == SyncStatus::Completed {
            100.0
        } else if self.total_requests == 0 {
            0.0
        } else {
            (f64::from(self.completed_requests) / f64::from(self.total_requests) * 100.0).min(100.0)
        };

        SyncProgress {
            session_id: self.id,
            sync_type: self.sync_type,
            status: self.status,
            total_requests: self.total_requests,
            completed_requests: self.completed_requests,
            failed_requests: self.failed_requests,
            items_synced: self.items_synced,
            percent_complete,
            estimated_time_left_secs: self.estimate_time_left(now),
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_error: self.last_error.clone(),
        }
    }

    /// Linear extrapolation from elapsed time and completion ratio
    fn estimate_time_left(&self, now: DateTime<Utc>) -> Option<u64> {
        if self.status.is_terminal() {
            return Some(0);
        }
        let started = self.started_at?;
        if self.completed_requests == 0 || self.total_requests == 0 {
            return None;
        }
        let elapsed = (now - started).num_milliseconds().max(0) as f64;
        let remaining = self.total_requests.saturating_sub(self.completed_requests) as f64;
        let per_request = elapsed / f64::from(self.completed_requests);
        Some((per_request * remaining / 1000.0).round() as u64)
    }
}

/// Snapshot returned by `GET /sync/status/:id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub session_id: SyncSessionId,
    pub sync_type: SyncType,
    pub status: SyncStatus,
    pub total_requests: u32,
    pub completed_requests: u32,
    pub failed_requests: u32,
    pub items_synced: u64,
    pub percent_complete: f64,
    pub estimated_time_left_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SyncStatus; 6] = [
        SyncStatus::Pending,
        SyncStatus::Running,
        SyncStatus::Paused,
        SyncStatus::Completed,
        SyncStatus::Failed,
        SyncStatus::Cancelled,
    ];

    fn session() -> SyncSession {
        SyncSession::new(Uuid::new_v4(), "digger", SyncType::Collection, false, None)
    }

    #[test]
    fn test_transition_table() {
        let allowed = [
            (SyncStatus::Pending, SyncStatus::Running),
            (SyncStatus::Pending, SyncStatus::Cancelled),
            (SyncStatus::Pending, SyncStatus::Failed),
            (SyncStatus::Running, SyncStatus::Paused),
            (SyncStatus::Running, SyncStatus::Completed),
            (SyncStatus::Running, SyncStatus::Failed),
            (SyncStatus::Running, SyncStatus::Cancelled),
            (SyncStatus::Paused, SyncStatus::Running),
            (SyncStatus::Paused, SyncStatus::Cancelled),
        ];

        for from in ALL {
            for to in ALL {
                let mut s = session();
                s.status = from;
                let result = s.apply_transition(to, Utc::now());
                if allowed.contains(&(from, to)) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                    assert_eq!(s.status, to);
                } else {
                    assert!(
                        matches!(result, Err(SyncError::InvalidTransition { .. })),
                        "{from} -> {to} should be rejected"
                    );
                    assert_eq!(s.status, from);
                }
            }
        }
    }

    #[test]
    fn test_resume_keeps_original_start() {
        let mut s = session();
        s.apply_transition(SyncStatus::Running, Utc::now()).unwrap();
        let started = s.started_at;
        s.apply_transition(SyncStatus::Paused, Utc::now()).unwrap();
        s.apply_transition(SyncStatus::Running, Utc::now()).unwrap();
        assert_eq!(s.started_at, started);
        assert!(s.completed_at.is_none());
    }

    #[test]
    fn test_record_page_caps_total_by_page_limit() {
        let mut s = SyncSession::new(Uuid::new_v4(), "digger", SyncType::Wantlist, true, Some(3));
        s.record_page(40, 100);
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.next_page, 2);
        s.record_page(40, 100);
        s.record_page(40, 100);
        assert!(s.pages_exhausted());
        assert_eq!(s.items_synced, 300);
    }

    #[test]
    fn test_progress_extrapolates_linearly() {
        let mut s = session();
        let start = Utc::now();
        s.apply_transition(SyncStatus::Running, start).unwrap();
        s.record_page(4, 100);

        let progress = s.progress(start + chrono::Duration::seconds(10));
        assert_eq!(progress.percent_complete, 25.0);
        assert_eq!(progress.estimated_time_left_secs, Some(30));
    }

    #[test]
    fn test_progress_before_first_page_has_no_estimate() {
        let mut s = session();
        s.apply_transition(SyncStatus::Running, Utc::now()).unwrap();
        let progress = s.progress(Utc::now());
        assert_eq!(progress.percent_complete, 0.0);
        assert!(progress.estimated_time_left_secs.is_none());
    }

    #[test]
    fn test_status_parse_and_activity() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<SyncStatus>().unwrap(), status);
        }
        assert!(SyncStatus::Paused.is_active());
        assert!(!SyncStatus::Cancelled.is_active());
        assert!("done".parse::<SyncStatus>().is_err());
    }
}

//! Progress push events
//!
//! Drive loops publish into a channel; one broadcaster task owns delivery to
//! the user's relay socket. Publishing never blocks and never fails the sync.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::models::{SyncSession, SyncSessionId};
use super::relay::RequestRelay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    SyncProgress,
    SyncComplete,
    SyncError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event: ProgressEventKind,
    pub session_id: SyncSessionId,
    pub percent_complete: f64,
    pub completed_requests: u32,
    pub failed_requests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    pub fn from_session(kind: ProgressEventKind, session: &SyncSession, message: Option<String>) -> Self {
        let progress = session.progress(chrono::Utc::now());
        Self {
            event: kind,
            session_id: session.id,
            percent_complete: progress.percent_complete,
            completed_requests: session.completed_requests,
            failed_requests: session.failed_requests,
            message,
        }
    }
}

struct ProgressUpdate {
    user_id: Uuid,
    event: ProgressEvent,
}

#[derive(Clone)]
pub struct ProgressPublisher {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressPublisher {
    pub fn publish(&self, user_id: Uuid, event: ProgressEvent) {
        if self.tx.send(ProgressUpdate { user_id, event }).is_err() {
            debug!(user_id = %user_id, "Progress broadcaster has stopped");
        }
    }
}

/// Start the task that forwards published events to relay sockets.
/// It exits once every [`ProgressPublisher`] is dropped.
pub fn spawn_broadcaster(relay: RequestRelay) -> (ProgressPublisher, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ProgressUpdate>();

    let handle = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            if !relay.push(update.user_id, &update.event).await {
                trace!(
                    user_id = %update.user_id,
                    session_id = %update.event.session_id,
                    "User offline, progress event dropped"
                );
            }
        }
        debug!("Progress broadcaster stopped");
    });

    (ProgressPublisher { tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::SyncType;
    use std::time::Duration;

    #[test]
    fn test_event_wire_shape() {
        let session = SyncSession::new(Uuid::new_v4(), "digger", SyncType::Wantlist, false, None);
        let event = ProgressEvent::from_session(ProgressEventKind::SyncError, &session, Some("boom".into()));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["event"], "sync_error");
        assert_eq!(json["sessionId"], session.id.to_string());
        assert_eq!(json["percentComplete"], 0.0);
        assert_eq!(json["message"], "boom");

        let quiet = ProgressEvent::from_session(ProgressEventKind::SyncProgress, &session, None);
        assert!(serde_json::to_value(&quiet).unwrap().get("message").is_none());
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_connected_user() {
        let relay = RequestRelay::new(Duration::from_secs(5));
        let user = Uuid::new_v4();
        let (_, mut outbound) = relay.register(user).await;
        let (publisher, handle) = spawn_broadcaster(relay.clone());

        let session = SyncSession::new(user, "digger", SyncType::Collection, true, None);
        // Offline users are skipped without error
        publisher.publish(
            Uuid::new_v4(),
            ProgressEvent::from_session(ProgressEventKind::SyncProgress, &session, None),
        );
        publisher.publish(
            user,
            ProgressEvent::from_session(ProgressEventKind::SyncComplete, &session, None),
        );

        let frame = outbound.recv().await.unwrap();
        let event: ProgressEvent = serde_json::from_str(&frame).unwrap();
        assert_eq!(event.event, ProgressEventKind::SyncComplete);
        assert_eq!(event.session_id, session.id);

        drop(publisher);
        handle.await.unwrap();
    }
}

//! Request relay over the user's WebSocket
//!
//! The Discogs API is called from the user's browser, not from this server.
//! [`RequestRelay::dispatch`] sends an `api_request` envelope down the user's
//! socket and parks a oneshot keyed by `requestId`; the matching
//! `api_response` coming back up the socket completes it. A request that is
//! not answered before its deadline is removed and fails with
//! [`RelayError::Timeout`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::RelayError;
use crate::ingest::scheduler::Job;

pub const API_REQUEST: &str = "api_request";
pub const API_RESPONSE: &str = "api_response";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

pub const SWEEP_JOB_NAME: &str = "relay-sweep";

/// Frame on the relay socket, both directions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub request_id: Uuid,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl RelayRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub request_id: Uuid,
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// Outbound half of a registered socket
pub type Outbound = mpsc::UnboundedReceiver<String>;

struct Connection {
    id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

struct Pending {
    user_id: Uuid,
    connection_id: Uuid,
    deadline: Instant,
    tx: oneshot::Sender<Result<RelayResponse, RelayError>>,
}

struct RelayInner {
    connections: Mutex<HashMap<Uuid, Connection>>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct RequestRelay {
    inner: Arc<RelayInner>,
}

impl RequestRelay {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Attach a socket for `user_id`, replacing any previous one
    pub async fn register(&self, user_id: Uuid) -> (Uuid, Outbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();

        let replaced = self
            .inner
            .connections
            .lock()
            .await
            .insert(user_id, Connection { id: connection_id, tx });

        if let Some(old) = replaced {
            let failed = self.fail_connection(old.id).await;
            debug!(user_id = %user_id, failed, "Relay connection replaced");
        }

        debug!(user_id = %user_id, connection_id = %connection_id, "Relay connection registered");
        (connection_id, rx)
    }

    /// Detach `connection_id` if it is still the user's live socket
    pub async fn unregister(&self, user_id: Uuid, connection_id: Uuid) {
        {
            let mut connections = self.inner.connections.lock().await;
            match connections.get(&user_id) {
                Some(conn) if conn.id == connection_id => {
                    connections.remove(&user_id);
                }
                _ => {}
            }
        }

        let failed = self.fail_connection(connection_id).await;
        debug!(
            user_id = %user_id,
            connection_id = %connection_id,
            failed,
            "Relay connection closed"
        );
    }

    pub async fn is_connected(&self, user_id: Uuid) -> bool {
        self.inner.connections.lock().await.contains_key(&user_id)
    }

    /// Send `request` through the user's socket and wait for its answer
    pub async fn dispatch(
        &self,
        user_id: Uuid,
        request: RelayRequest,
    ) -> Result<RelayResponse, RelayError> {
        let request_id = request.request_id;
        let payload = serde_json::to_value(&request)
            .map_err(|e| RelayError::Serialization(e.to_string()))?;
        let frame = serde_json::to_string(&Envelope::new(API_REQUEST, payload))
            .map_err(|e| RelayError::Serialization(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let connections = self.inner.connections.lock().await;
            let conn = connections
                .get(&user_id)
                .ok_or(RelayError::NoConnection(user_id))?;

            self.inner.pending.lock().await.insert(
                request_id,
                Pending {
                    user_id,
                    connection_id: conn.id,
                    deadline: Instant::now() + self.inner.timeout,
                    tx,
                },
            );

            if conn.tx.send(frame).is_err() {
                self.inner.pending.lock().await.remove(&request_id);
                return Err(RelayError::ConnectionClosed(request_id));
            }
        }

        match tokio::time::timeout(self.inner.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::ConnectionClosed(request_id)),
            Err(_) => {
                self.inner.pending.lock().await.remove(&request_id);
                Err(RelayError::Timeout(request_id))
            }
        }
    }

    /// Complete the pending request `response` answers; false if none is waiting
    pub async fn resolve(&self, response: RelayResponse) -> bool {
        let Some(pending) = self.inner.pending.lock().await.remove(&response.request_id) else {
            debug!(request_id = %response.request_id, "Late or unknown relay response");
            return false;
        };
        pending.tx.send(Ok(response)).is_ok()
    }

    /// Drop pending requests whose deadline has passed
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.inner.pending.lock().await;
        let expired: Vec<Uuid> = pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for request_id in &expired {
            if let Some(entry) = pending.remove(request_id) {
                let _ = entry.tx.send(Err(RelayError::Timeout(*request_id)));
            }
        }
        expired.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Push an unsolicited message to the user; false if they are offline
    pub async fn push<T: Serialize>(&self, user_id: Uuid, message: &T) -> bool {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Could not encode push message");
                return false;
            }
        };
        match self.inner.connections.lock().await.get(&user_id) {
            Some(conn) => conn.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Handle a text frame from `user_id`'s socket, returning a reply frame if one is due.
    /// Responses only count when they arrive on the connection the request went out on.
    pub async fn handle_inbound(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        text: &str,
    ) -> Option<String> {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Malformed relay frame");
                return None;
            }
        };

        match envelope.kind.as_str() {
            API_RESPONSE => {
                match serde_json::from_value::<RelayResponse>(envelope.payload) {
                    Ok(response) => {
                        if self.owner_of(response.request_id).await == Some((user_id, connection_id)) {
                            self.resolve(response).await;
                        } else {
                            debug!(
                                user_id = %user_id,
                                connection_id = %connection_id,
                                request_id = %response.request_id,
                                "Ignoring response for a request not sent on this connection"
                            );
                        }
                    }
                    Err(e) => warn!(user_id = %user_id, error = %e, "Malformed api_response payload"),
                }
                None
            }
            PING => serde_json::to_string(&Envelope {
                id: envelope.id,
                kind: PONG.to_string(),
                payload: serde_json::Value::Null,
            })
            .ok(),
            other => {
                debug!(user_id = %user_id, kind = other, "Ignoring relay frame");
                None
            }
        }
    }

    async fn owner_of(&self, request_id: Uuid) -> Option<(Uuid, Uuid)> {
        self.inner
            .pending
            .lock()
            .await
            .get(&request_id)
            .map(|p| (p.user_id, p.connection_id))
    }

    async fn fail_connection(&self, connection_id: Uuid) -> usize {
        let mut pending = self.inner.pending.lock().await;
        let orphaned: Vec<Uuid> = pending
            .iter()
            .filter(|(_, p)| p.connection_id == connection_id)
            .map(|(id, _)| *id)
            .collect();

        for request_id in &orphaned {
            if let Some(entry) = pending.remove(request_id) {
                let _ = entry.tx.send(Err(RelayError::ConnectionClosed(*request_id)));
            }
        }
        orphaned.len()
    }
}

/// Scheduled removal of pending requests nobody answered
pub struct RelaySweepJob {
    relay: RequestRelay,
}

impl RelaySweepJob {
    pub fn new(relay: RequestRelay) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Job for RelaySweepJob {
    fn name(&self) -> &'static str {
        SWEEP_JOB_NAME
    }

    async fn run(&self) -> anyhow::Result<()> {
        let swept = self.relay.sweep_expired().await;
        if swept > 0 {
            debug!(swept, "Swept expired relay requests");
        }
        Ok(())
    }
}

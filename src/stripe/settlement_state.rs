// Settlement state coordination: broadcasts webhook-driven outcomes to
// in-process waiters keyed by the provider object id (checkout session,
// payment intent, transfer or payout).

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

const DEFAULT_CHANNEL_CAPACITY: usize = 100;
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Status of a settlement as it progresses through the lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementStatus {
    Processing,
    Settled { amount_minor: i64, currency: String },
    Failed { reason: String },
}

/// Update message sent to waiters
#[derive(Debug, Clone)]
pub struct SettlementUpdate {
    pub object_id: String,
    pub status: SettlementStatus,
    pub message: Option<String>,
}

/// Internal session data for one awaited settlement
struct SettlementSession {
    tx: broadcast::Sender<SettlementUpdate>,
    created_at: Instant,
    completed: bool,
}

impl SettlementSession {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            tx,
            created_at: Instant::now(),
            completed: false,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Shared settlement state coordinator
pub struct SettlementState {
    sessions: Arc<RwLock<HashMap<String, SettlementSession>>>,
    session_ttl: Duration,
}

impl SettlementState {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    /// Register a waiter for settlement updates and return a receiver
    pub async fn register_waiter(
        &self,
        object_id: &str,
    ) -> Result<broadcast::Receiver<SettlementUpdate>> {
        let mut sessions = self.sessions.write().await;

        // Clean up expired sessions opportunistically
        self.cleanup_expired_sessions(&mut sessions);

        let session = sessions.entry(object_id.to_string()).or_insert_with(|| {
            debug!(
                object_id = %object_id,
                "Registering new settlement session"
            );
            SettlementSession::new()
        });

        let rx = session.tx.subscribe();
        Ok(rx)
    }

    /// Publish a status update to all waiters for an object id
    pub async fn publish_status(
        &self,
        object_id: &str,
        status: SettlementStatus,
        message: Option<String>,
    ) -> Result<usize> {
        let mut sessions = self.sessions.write().await;

        let session = match sessions.get_mut(object_id) {
            Some(s) => s,
            None => {
                debug!(
                    object_id = %object_id,
                    "No waiter found for settlement status update"
                );
                return Ok(0);
            }
        };

        let update = SettlementUpdate {
            object_id: object_id.to_string(),
            status,
            message,
        };

        match session.tx.send(update) {
            Ok(count) => {
                debug!(
                    object_id = %object_id,
                    receivers = count,
                    "Published settlement status update"
                );
                Ok(count)
            }
            Err(e) => {
                warn!(
                    object_id = %object_id,
                    error = %e,
                    "Failed to publish settlement status update (no receivers)"
                );
                Ok(0)
            }
        }
    }

    /// Mark a settlement session as completed
    pub async fn mark_completed(&self, object_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(object_id) {
            session.completed = true;
            debug!(
                object_id = %object_id,
                "Marked settlement session as completed"
            );
        }
    }

    /// Remove a waiter/session
    pub async fn remove_waiter(&self, object_id: &str) {
        let mut sessions = self.sessions.write().await;
        if sessions.remove(object_id).is_some() {
            debug!(
                object_id = %object_id,
                "Removed settlement session"
            );
        }
    }

    /// Check if a session exists
    pub async fn has_session(&self, object_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(object_id)
    }

    /// Whether a settlement reached a terminal state
    pub async fn is_completed(&self, object_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.get(object_id).map(|s| s.completed).unwrap_or(false)
    }

    /// Get receiver count for a session
    pub async fn receiver_count(&self, object_id: &str) -> usize {
        let sessions = self.sessions.read().await;
        sessions
            .get(object_id)
            .map(|s| s.tx.receiver_count())
            .unwrap_or(0)
    }

    /// Clean up expired sessions (called opportunistically during register_waiter)
    fn cleanup_expired_sessions(&self, sessions: &mut HashMap<String, SettlementSession>) {
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_expired(self.session_ttl))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            sessions.remove(&id);
            debug!(object_id = %id, "Cleaned up expired settlement session");
        }
    }
}

impl Default for SettlementState {
    fn default() -> Self {
        Self::new()
    }
}

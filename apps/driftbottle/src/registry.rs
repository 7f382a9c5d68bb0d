use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::protocol::UserId;
use crate::session::Session;

/// Process-local directory of connected sessions, keyed by user identity.
/// Authoritative only for this instance: a miss means "not connected
/// *here*", nothing more — the user may well be on another instance.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<DashMap<UserId, Arc<Session>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last-writer-wins: a reconnect supersedes whatever was registered for
    /// the identity. The displaced session gets cancelled so its pumps stop
    /// competing for the user's traffic.
    pub fn register(&self, session: Arc<Session>) {
        let user_id = session.user_id().to_string();
        if let Some(previous) = self.sessions.insert(user_id, session.clone()) {
            if previous.conn_id() != session.conn_id() {
                warn!(
                    user = %session.user_id(),
                    stale_conn = %previous.conn_id(),
                    "reconnect superseded a live session"
                );
                previous.cancel();
            }
        }
        counter!("driftbottle_sessions_registered_total", 1);
        gauge!("driftbottle_sessions_online", self.sessions.len() as f64);
    }

    /// Removes the entry only if it still belongs to this connection, so a
    /// stale session's teardown can never erase its successor.
    pub fn unregister(&self, session: &Session) -> bool {
        let removed = self
            .sessions
            .remove_if(session.user_id(), |_, current| {
                current.conn_id() == session.conn_id()
            })
            .is_some();
        gauge!("driftbottle_sessions_online", self.sessions.len() as f64);
        removed
    }

    /// Hot path of the delivery loop: O(1), lock-free, no allocation.
    pub fn find(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(user_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Periodic sweep cancelling sessions with no inbound activity past
    /// `idle_timeout` — the backstop for half-open connections whose
    /// keepalives stopped coming back. Cancelling lets the owning
    /// connection task run the ordinary teardown.
    pub fn spawn_reaper(&self, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                // Collect first; cancelling while holding a shard guard
                // would hold the map against the delivery path.
                let stale: Vec<Arc<Session>> = registry
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().idle_for() > idle_timeout)
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                for session in stale {
                    info!(
                        user = %session.user_id(),
                        idle_secs = session.idle_for().as_secs(),
                        "reaping idle session"
                    );
                    counter!("driftbottle_sessions_reaped_total", 1);
                    session.cancel();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matchmaker::Criteria;

    fn session_for(user: &str) -> Arc<Session> {
        Session::new(user.to_string(), Criteria::Any, 4).0
    }

    #[tokio::test]
    async fn find_after_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let session = session_for("alice");
        registry.register(session.clone());
        assert_eq!(
            registry.find("alice").unwrap().conn_id(),
            session.conn_id()
        );
        assert!(registry.unregister(&session));
        assert!(registry.find("alice").is_none());
    }

    #[tokio::test]
    async fn find_miss_is_none_not_a_failure() {
        let registry = ConnectionRegistry::new();
        assert!(registry.find("nobody").is_none());
    }

    #[tokio::test]
    async fn reconnect_supersedes_and_cancels_the_stale_session() {
        let registry = ConnectionRegistry::new();
        let first = session_for("alice");
        let second = session_for("alice");
        registry.register(first.clone());
        registry.register(second.clone());

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(
            registry.find("alice").unwrap().conn_id(),
            second.conn_id()
        );

        // the stale session's teardown must not remove the fresh entry
        assert!(!registry.unregister(&first));
        assert_eq!(
            registry.find("alice").unwrap().conn_id(),
            second.conn_id()
        );
        assert!(registry.unregister(&second));
        assert!(registry.find("alice").is_none());
    }
}

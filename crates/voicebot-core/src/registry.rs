//! Process-wide map from call id to [`Session`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::session::{Session, SessionSnapshot};

/// Registry of active sessions, keyed by call id.
///
/// Creation happens under the write lock, so concurrent connections that
/// share a call id always observe the same `Session`.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `call_id`, creating it if absent.
    pub async fn register(&self, call_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(call_id) {
            debug!(call_id, "Reusing existing session");
            return existing.clone();
        }
        let session = Arc::new(Session::new(call_id));
        sessions.insert(call_id.to_owned(), session.clone());
        info!(call_id, active = sessions.len(), "Session registered");
        session
    }

    /// Return the session for `call_id`, creating it if absent, and count
    /// one more connection on it. Pair every call with [`Self::detach`].
    pub async fn attach(&self, call_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(call_id.to_owned())
            .or_insert_with(|| Arc::new(Session::new(call_id)))
            .clone();
        let connections = session.attach();
        info!(call_id, connections, active = sessions.len(), "Connection attached");
        session
    }

    /// Drop one connection from `session`. The last connection to leave
    /// unregisters and releases it; returns `true` when that happened.
    pub async fn detach(&self, session: &Arc<Session>) -> bool {
        let call_id = session.call_id();
        let mut sessions = self.sessions.write().await;
        let remaining = session.detach();
        if remaining > 0 {
            debug!(call_id, remaining, "Connection detached, session still in use");
            return false;
        }
        if sessions
            .get(call_id)
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(call_id);
        }
        drop(sessions);

        let (chunks, bytes) = session.release();
        info!(call_id, chunks, bytes, "Session released");
        true
    }

    pub async fn get(&self, call_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(call_id).cloned()
    }

    /// Remove and release a session. No-op if absent.
    pub async fn remove(&self, call_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(call_id);
        if let Some(session) = &removed {
            let (chunks, bytes) = session.release();
            info!(call_id, chunks, bytes, "Session removed");
        }
        removed
    }

    pub async fn list(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        let mut snapshots: Vec<_> = sessions.values().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = SessionRegistry::new();
        let a = registry.register("CA1").await;
        let b = registry.register("CA1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_register_creates_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.register("CA1").await }));
        }
        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_remove_releases_and_is_repeatable() {
        let registry = SessionRegistry::new();
        let session = registry.register("CA1").await;
        session.push_inbound_audio(vec![0; 160]);

        let removed = registry.remove("CA1").await.expect("session should exist");
        assert!(!removed.is_active());
        assert_eq!(removed.inbound_stats(), (0, 0));
        assert!(registry.get("CA1").await.is_none());

        assert!(registry.remove("CA1").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shared_session_survives_until_last_detach() {
        let registry = SessionRegistry::new();
        let a = registry.attach("CA1").await;
        let b = registry.attach("CA1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.connection_count(), 2);

        assert!(!registry.detach(&a).await);
        assert!(b.is_active());
        assert!(registry.get("CA1").await.is_some());

        assert!(registry.detach(&b).await);
        assert!(!b.is_active());
        assert!(registry.get("CA1").await.is_none());
    }

    #[tokio::test]
    async fn test_stale_detach_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let old = registry.attach("CA1").await;
        assert!(registry.detach(&old).await);

        let newer = registry.attach("CA1").await;
        assert!(!Arc::ptr_eq(&old, &newer));

        assert!(registry.detach(&old).await);
        let current = registry.get("CA1").await.expect("newer session kept");
        assert!(Arc::ptr_eq(&current, &newer));
        assert!(newer.is_active());
    }

    #[tokio::test]
    async fn test_list_snapshots() {
        let registry = SessionRegistry::new();
        registry.register("CA1").await;
        registry.register("CA2").await.set_stream_id("MZ2");

        let list = registry.list().await;
        assert_eq!(list.len(), 2);
        let ca2 = list.iter().find(|s| s.call_id == "CA2").unwrap();
        assert_eq!(ca2.stream_id.as_deref(), Some("MZ2"));
    }
}

//! Session Registry
//!
//! Owns every live [`SessionState`] plus the `user_id -> session_id` index used
//! to enforce one session per user. Both maps are guarded by a single async
//! mutex whose critical sections are pure in-memory work.

use crate::{
    error::RelayError,
    session::{ConnectionHandle, SessionId, SessionState},
};
use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Default)]
struct Maps {
    sessions: HashMap<SessionId, Arc<SessionState>>,
    users: HashMap<String, SessionId>,
}

impl Maps {
    /// Drops the session's user mapping if it still points at this session.
    fn release_user(&mut self, session: &SessionState) {
        if let Some(user_id) = session.user_id() {
            if self.users.get(&user_id) == Some(session.id()) {
                self.users.remove(&user_id);
            }
        }
    }
}

/// The process-wide table of active sessions.
pub struct SessionRegistry {
    max_sessions: usize,
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            max_sessions: max_sessions.max(1),
            maps: Mutex::new(Maps::default()),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Creates and stores a session for `session_id`.
    ///
    /// At capacity the least recently active session is evicted first and its
    /// connection is signalled to close.
    pub async fn create(&self, session_id: &str) -> Result<Arc<SessionState>, RelayError> {
        let id = SessionId::parse(session_id).inspect_err(|_| {
            warn!(session_id, "Rejected session with invalid ID format");
        })?;

        let mut maps = self.maps.lock().await;
        if maps.sessions.len() >= self.max_sessions {
            let oldest = maps
                .sessions
                .values()
                .min_by_key(|s| s.last_activity_at())
                .map(|s| s.id().clone());
            if let Some(oldest) = oldest {
                if let Some(evicted) = maps.sessions.remove(&oldest) {
                    maps.release_user(&evicted);
                    evicted.connection().close();
                    warn!(
                        max_sessions = self.max_sessions,
                        evicted = %oldest,
                        "Max sessions reached, removed least recently active session"
                    );
                }
            }
        }

        let session = Arc::new(SessionState::new(id.clone()));
        maps.sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionState>> {
        let id = SessionId::parse(session_id).ok()?;
        self.maps.lock().await.sessions.get(&id).cloned()
    }

    /// Removes a session. The user mapping is only dropped if it still points
    /// at this session, so a stale removal never unmaps a newer session.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<SessionState>> {
        let id = SessionId::parse(session_id).ok()?;
        let mut maps = self.maps.lock().await;
        let removed = maps.sessions.remove(&id)?;
        maps.release_user(&removed);
        if let Some(email) = removed.user_email() {
            info!(user_email = %email, session_id = %id, "User session mapping released");
        }
        Some(removed)
    }

    /// Binds an authenticated user to `session_id`.
    ///
    /// If the user already owns a different live session, that session is
    /// removed and its connection handle returned so the caller can close it.
    pub async fn register_user(
        &self,
        session_id: &str,
        user_id: &str,
        user_email: &str,
        connection: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let id = SessionId::parse(session_id).ok()?;
        let mut maps = self.maps.lock().await;
        if !maps.sessions.contains_key(&id) {
            warn!(user_email, session_id = %id, "Session gone before user registration");
            return None;
        }

        let mut previous = None;
        if let Some(old_id) = maps.users.get(user_id).cloned() {
            if old_id != id {
                if let Some(old) = maps.sessions.remove(&old_id) {
                    info!(user_email, old_session = %old_id, "Kicking existing session for user");
                    previous = Some(old.connection());
                }
            }
        }

        if let Some(session) = maps.sessions.get(&id) {
            session.assign_user(user_id, user_email, connection);
            info!(user_email, session_id = %id, "User registered with session");
        }
        maps.users.insert(user_id.to_string(), id);
        previous
    }

    pub async fn get_by_user(&self, user_id: &str) -> Option<(SessionId, Arc<SessionState>)> {
        let maps = self.maps.lock().await;
        let id = maps.users.get(user_id)?;
        maps.sessions
            .get(id)
            .map(|session| (id.clone(), session.clone()))
    }

    pub async fn touch_activity(&self, session_id: &SessionId) {
        if let Some(session) = self.maps.lock().await.sessions.get(session_id) {
            session.mark_activity(Utc::now());
        }
    }

    /// A point-in-time copy of every entry.
    pub async fn snapshot(&self) -> HashMap<SessionId, Arc<SessionState>> {
        self.maps.lock().await.sessions.clone()
    }

    pub async fn len(&self) -> usize {
        self.maps.lock().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new(10);
        let id = new_id();
        let created = registry.create(&id).await.unwrap();
        let fetched = registry.get(&id).await.expect("session should exist");
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_ignores_id_case() {
        let registry = SessionRegistry::new(10);
        let id = new_id();
        registry.create(&id).await.unwrap();
        assert!(registry.get(&id.to_ascii_uppercase()).await.is_some());
        assert!(registry.remove(&id.to_ascii_uppercase()).await.is_some());
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_id() {
        let registry = SessionRegistry::new(10);
        let err = registry.create("session-123").await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidSessionId));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recently_active() {
        let registry = SessionRegistry::new(3);
        let now = Utc::now();
        let ids: Vec<String> = (0..3).map(|_| new_id()).collect();
        for (age, id) in [30, 90, 60].into_iter().zip(&ids) {
            let session = registry.create(id).await.unwrap();
            session.mark_activity(now - Duration::seconds(age));
        }
        let oldest_handle = registry.get(&ids[1]).await.unwrap().connection();

        let newcomer = new_id();
        registry.create(&newcomer).await.unwrap();

        assert_eq!(registry.len().await, 3);
        assert!(registry.get(&ids[1]).await.is_none());
        assert!(registry.get(&ids[0]).await.is_some());
        assert!(registry.get(&ids[2]).await.is_some());
        assert!(registry.get(&newcomer).await.is_some());
        assert!(oldest_handle.is_closed());
    }

    #[tokio::test]
    async fn test_size_never_exceeds_max() {
        let registry = SessionRegistry::new(5);
        for _ in 0..20 {
            registry.create(&new_id()).await.unwrap();
            assert!(registry.len().await <= 5);
        }
    }

    #[tokio::test]
    async fn test_register_user_kicks_previous_session() {
        let registry = SessionRegistry::new(10);
        let first = new_id();
        let second = new_id();
        let first_session = registry.create(&first).await.unwrap();
        let second_session = registry.create(&second).await.unwrap();
        let first_conn = first_session.connection();

        let kicked = registry
            .register_user(&first, "user-1", "a@example.com", first_conn.clone())
            .await;
        assert!(kicked.is_none());

        let kicked = registry
            .register_user(&second, "user-1", "a@example.com", second_session.connection())
            .await
            .expect("first session should be returned");
        assert!(kicked.same_connection(&first_conn));
        assert!(registry.get(&first).await.is_none());

        let (owner, session) = registry.get_by_user("user-1").await.unwrap();
        assert_eq!(owner.as_str(), second);
        assert_eq!(session.user_email().as_deref(), Some("a@example.com"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_reregistering_same_session_is_not_a_kick() {
        let registry = SessionRegistry::new(10);
        let id = new_id();
        let session = registry.create(&id).await.unwrap();
        registry
            .register_user(&id, "user-1", "a@example.com", session.connection())
            .await;
        let kicked = registry
            .register_user(&id, "user-1", "a@example.com", session.connection())
            .await;
        assert!(kicked.is_none());
        assert!(registry.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_remove_keeps_newer_user_mapping() {
        let registry = SessionRegistry::new(10);
        let first = new_id();
        let second = new_id();
        let first_session = registry.create(&first).await.unwrap();
        let second_session = registry.create(&second).await.unwrap();
        registry
            .register_user(&first, "user-1", "a@example.com", first_session.connection())
            .await;
        registry
            .register_user(&second, "user-1", "a@example.com", second_session.connection())
            .await;

        // The kicked connection's supervisor tears down afterwards.
        assert!(registry.remove(&first).await.is_none());
        let (owner, _) = registry.get_by_user("user-1").await.unwrap();
        assert_eq!(owner.as_str(), second);

        registry.remove(&second).await.unwrap();
        assert!(registry.get_by_user("user-1").await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_eviction_releases_user_mapping() {
        let registry = SessionRegistry::new(1);
        let first = new_id();
        let session = registry.create(&first).await.unwrap();
        registry
            .register_user(&first, "user-1", "a@example.com", session.connection())
            .await;

        registry.create(&new_id()).await.unwrap();
        assert!(registry.get_by_user("user-1").await.is_none());
    }

    #[tokio::test]
    async fn test_register_user_after_eviction_leaves_no_mapping() {
        let registry = SessionRegistry::new(1);
        let first = new_id();
        let first_session = registry.create(&first).await.unwrap();
        registry.create(&new_id()).await.unwrap();

        let kicked = registry
            .register_user(&first, "user-9", "z@example.com", first_session.connection())
            .await;
        assert!(kicked.is_none());
        assert!(registry.get_by_user("user-9").await.is_none());

        assert!(registry.remove(&first).await.is_none());
        assert!(registry.maps.lock().await.users.is_empty());
    }

    #[tokio::test]
    async fn test_touch_activity_moves_timestamp_forward() {
        let registry = SessionRegistry::new(10);
        let id = new_id();
        let session = registry.create(&id).await.unwrap();
        let stale = Utc::now() - Duration::seconds(120);
        session.mark_activity(stale);

        registry.touch_activity(session.id()).await;
        assert!(session.last_activity_at() > stale);
    }

    #[tokio::test]
    async fn test_snapshot_is_a_copy() {
        let registry = SessionRegistry::new(10);
        let id = new_id();
        registry.create(&id).await.unwrap();
        let snapshot = registry.snapshot().await;
        registry.remove(&id).await;
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty().await);
    }
}

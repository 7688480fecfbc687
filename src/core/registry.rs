// Concurrent session registry.

use dashmap::DashMap;
use std::sync::Arc;

use super::session::{Session, SessionKey};

/// Concurrent map keyed by `(client, deviceId)` (case-insensitive). Reads
/// use the map's intrinsic concurrent semantics; the single
/// insert-or-update path that must not race is serialized by the manager's
/// primary lock, not by this type.
#[derive(Default)]
pub struct SessionRegistry {
    by_key: DashMap<SessionKey, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.by_key.get(key).map(|entry| entry.value().clone())
    }

    /// Caller is expected to hold the manager's primary lock before calling
    /// this for the create-or-update path.
    pub fn insert(&self, key: SessionKey, session: Arc<Session>) {
        self.by_key.insert(key, session);
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.by_key.remove(key).map(|(_, session)| session)
    }

    pub fn get_by_id(&self, session_id: &str) -> Option<Arc<Session>> {
        self.by_key
            .iter()
            .find(|entry| entry.value().id == session_id)
            .map(|entry| entry.value().clone())
    }

    pub fn remove_by_id(&self, session_id: &str) -> Option<Arc<Session>> {
        let key = self
            .by_key
            .iter()
            .find(|entry| entry.value().id == session_id)
            .map(|entry| entry.key().clone())?;
        self.remove(&key)
    }

    pub fn by_device(&self, device_id: &str) -> Vec<Arc<Session>> {
        self.by_key
            .iter()
            .filter(|entry| entry.value().device_id.eq_ignore_ascii_case(device_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn by_device_and_client(&self, device_id: &str, client: &str) -> Option<Arc<Session>> {
        self.get(&SessionKey::new(client, device_id))
    }

    /// A stable, point-in-time snapshot ordered by `lastActivityDate`
    /// descending.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> =
            self.by_key.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by(|a, b| b.last_activity_date().cmp(&a.last_activity_date()));
        sessions
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn insert_then_get_round_trips() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("Web", "devA");
        let session = Arc::new(Session::new("Web", "devA", "Chrome", "1.0", "1.1.1.1", Utc::now()));
        registry.insert(key.clone(), session.clone());
        assert_eq!(registry.get(&key).unwrap().id, session.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_by_id_drops_the_only_key() {
        let registry = SessionRegistry::new();
        let key = SessionKey::new("Web", "devA");
        let session = Arc::new(Session::new("Web", "devA", "Chrome", "1.0", "1.1.1.1", Utc::now()));
        let id = session.id.clone();
        registry.insert(key, session);
        assert!(registry.remove_by_id(&id).is_some());
        assert!(registry.is_empty());
    }
}

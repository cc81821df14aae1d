use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::core::store::ChatStore;

/// Typed per-client state consulted when a message is sent
#[derive(Debug, Clone)]
pub struct ClientState {
    /// Identity used for flood control (client IP, or session id when unknown)
    pub client_key: String,
    /// A cooldown notice was already shown during the current cooldown
    pub cooldown_notice_sent: bool,
    pub last_scream: Option<DateTime<Utc>>,
}

impl ClientState {
    pub fn new(client_key: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            cooldown_notice_sent: false,
            last_scream: None,
        }
    }
}

/// A web client session, bound to at most one user at a time
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: Mutex<ClientState>,
}

// Manages the web sessions and their client state
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a fresh session keyed for flood control by `client_ip`
    pub async fn create(&self, client_ip: Option<&str>) -> Arc<Session> {
        let id = Uuid::new_v4().to_string();
        let client_key = client_ip.map_or_else(|| id.clone(), str::to_string);
        let session = Arc::new(Session {
            id: id.clone(),
            created_at: Utc::now(),
            state: Mutex::new(ClientState::new(client_key)),
        });
        self.sessions.write().await.insert(id, session.clone());
        debug!("Created session {}", session.id);
        session
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Return the session, or create one under the given id
    pub async fn get_or_create(&self, session_id: &str, client_ip: Option<&str>) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let client_key = client_ip.unwrap_or(session_id).to_string();
                Arc::new(Session {
                    id: session_id.to_string(),
                    created_at: Utc::now(),
                    state: Mutex::new(ClientState::new(client_key)),
                })
            })
            .clone()
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions that are older than `grace` and not bound to any user in `bound`
    pub async fn retain_bound(
        &self,
        bound: &HashSet<String>,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, session| bound.contains(id) || now - session.created_at < grace);
        before - sessions.len()
    }

    /// Periodically drop sessions that no live user is bound to
    pub fn start_cleanup_task(self: Arc<Self>, store: Arc<ChatStore>, every: std::time::Duration) {
        let grace = Duration::from_std(every).unwrap_or_else(|_| Duration::seconds(0));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let bound = store.bound_sessions().await;
                let removed = self.retain_bound(&bound, grace, Utc::now()).await;
                if removed > 0 {
                    info!("Session cleanup removed {} unbound sessions", removed);
                }
            }
        });
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Thread-safe session registry handle
pub type Sessions = Arc<SessionRegistry>;

pub fn create_session_registry() -> Sessions {
    Arc::new(SessionRegistry::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_uses_ip_as_client_key() {
        let registry = SessionRegistry::new();
        let with_ip = registry.create(Some("10.0.0.1")).await;
        let without_ip = registry.create(None).await;

        assert_eq!(with_ip.state.lock().await.client_key, "10.0.0.1");
        assert_eq!(without_ip.state.lock().await.client_key, without_ip.id);
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_existing() {
        let registry = SessionRegistry::new();
        let first = registry.get_or_create("abc", Some("1.1.1.1")).await;
        first.state.lock().await.cooldown_notice_sent = true;

        let second = registry.get_or_create("abc", Some("2.2.2.2")).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.state.lock().await.cooldown_notice_sent);
    }

    #[tokio::test]
    async fn test_retain_bound_keeps_bound_and_recent() {
        let registry = SessionRegistry::new();
        let bound_session = registry.create(None).await;
        let unbound = registry.create(None).await;

        let bound: HashSet<String> = [bound_session.id.clone()].into_iter().collect();

        // Fresh sessions survive within the grace period
        let removed = registry
            .retain_bound(&bound, Duration::seconds(120), Utc::now())
            .await;
        assert_eq!(removed, 0);

        let later = Utc::now() + Duration::seconds(300);
        let removed = registry
            .retain_bound(&bound, Duration::seconds(120), later)
            .await;
        assert_eq!(removed, 1);
        assert!(registry.get(&bound_session.id).await.is_some());
        assert!(registry.get(&unbound.id).await.is_none());
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{context::SessionContext, error::Result};

/// One interactive visit.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub context: SessionContext,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            context: SessionContext::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for storing and retrieving sessions
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn save(&self, session: Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn delete(&self, id: &str) -> Result<()>;
}

struct StoredSession {
    session: Session,
    last_access: Instant,
}

/// Process-local session storage. Sessions die with the process, or earlier when an
/// idle timeout is set and nobody touches them for that long.
#[derive(Default)]
pub struct InMemorySessionStorage {
    sessions: Arc<DashMap<String, StoredSession>>,
    idle_timeout: Option<Duration>,
}

impl InMemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::default(),
            idle_timeout: Some(idle_timeout),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn is_idle(&self, last_access: Instant, now: Instant) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| now.duration_since(last_access) >= timeout)
    }

    /// Removes and clears `id` if `expired` still holds for it under the map's lock.
    async fn evict(&self, id: &str, expired: impl Fn(&StoredSession) -> bool) -> bool {
        match self.sessions.remove_if(id, |_, stored| expired(stored)) {
            Some((_, stored)) => {
                stored.session.context.clear().await;
                true
            }
            None => false,
        }
    }

    async fn evict_idle(&self) {
        if self.idle_timeout.is_none() {
            return;
        }
        let now = Instant::now();
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| self.is_idle(entry.last_access, now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in idle {
            if self.evict(&id, |stored| self.is_idle(stored.last_access, now)).await {
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!("Evicted {} idle session(s)", evicted);
        }
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save(&self, session: Session) -> Result<()> {
        if session.context.is_closed().await {
            debug!("Not saving closed session {}", session.id);
            return Ok(());
        }
        self.evict_idle().await;
        self.sessions.insert(
            session.id.clone(),
            StoredSession {
                session,
                last_access: Instant::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        let now = Instant::now();
        let Some((session, last_access)) = self
            .sessions
            .get(id)
            .map(|stored| (stored.session.clone(), stored.last_access))
        else {
            return Ok(None);
        };

        if self.is_idle(last_access, now) {
            if self.evict(id, |stored| self.is_idle(stored.last_access, now)).await {
                info!("Session {} expired after being idle", id);
            }
            return Ok(None);
        }
        if session.context.is_closed().await {
            self.sessions.remove(id);
            return Ok(None);
        }

        if let Some(mut stored) = self.sessions.get_mut(id) {
            stored.last_access = now;
        }
        Ok(Some(session))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.evict(id, |_| true).await;
        Ok(())
    }
}

//! HTTP sessions of this node, keyed by cookie value.
//!
//! Expired sessions are dropped lazily on lookup and by a periodic sweep;
//! either way their session context is closed exactly once.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use scope_core::{Context, ContextSnapshot, HttpSessionContext};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SessionConfig;

pub struct SessionStore {
    config: SessionConfig,
    sessions: DashMap<String, Arc<HttpSessionContext>>,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a new session with a fresh id.
    pub fn create(&self) -> Arc<HttpSessionContext> {
        let id = Uuid::new_v4().simple().to_string();
        let session = Arc::new(HttpSessionContext::new(id.clone()));
        self.sessions.insert(id.clone(), session.clone());
        debug!(session = %id, "http session created");
        session
    }

    /// The live session `id`. An expired session is removed and closed.
    pub fn get(&self, id: &str) -> Option<Arc<HttpSessionContext>> {
        let session = self.sessions.get(id).map(|entry| entry.value().clone())?;
        if session.is_expired(self.config.max_idle_secs) {
            self.expire(id);
            return None;
        }
        Some(session)
    }

    /// The session a request asked for, or a new one when it asked for none
    /// or for one that no longer exists. The returned flag is `true` for a
    /// new session. The session is marked accessed.
    pub fn resolve(&self, requested: Option<&str>) -> (Arc<HttpSessionContext>, bool) {
        let (session, created) = match requested.and_then(|id| self.get(id)) {
            Some(session) => (session, false),
            None => (self.create(), true),
        };
        session.touch();
        (session, created)
    }

    /// End session `id` and close its context. Returns `false` if unknown.
    pub fn invalidate(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close();
                info!(session = %id, "http session invalidated");
                true
            }
            None => false,
        }
    }

    /// Transportable state of session `id`, for migration to another node.
    pub fn export(&self, id: &str) -> Option<ContextSnapshot> {
        self.get(id).map(|session| session.snapshot())
    }

    /// Adopt a session that migrated from another node under its original
    /// id. An existing local session with that id is replaced and closed.
    pub fn import(&self, id: &str, snapshot: ContextSnapshot) -> Arc<HttpSessionContext> {
        let session = Arc::new(HttpSessionContext::restore(id, snapshot));
        if let Some(previous) = self.sessions.insert(id.to_string(), session.clone()) {
            previous.close();
        }
        debug!(session = %id, "http session imported");
        session
    }

    /// Remove and close every expired session. Returns their ids.
    pub fn cleanup_expired(&self) -> Vec<String> {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(self.config.max_idle_secs))
            .map(|entry| entry.key().clone())
            .collect();

        let expired: Vec<String> = candidates.into_iter().filter(|id| self.expire(id)).collect();
        if !expired.is_empty() {
            info!(count = expired.len(), "expired http sessions removed");
        }
        expired
    }

    /// Close every session. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.iter().filter(|id| self.invalidate(id)).count()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sweep for expired sessions every `cleanup_interval` on the current
    /// runtime. The task ends once the store is dropped.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let interval = self.config.cleanup_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.cleanup_expired();
            }
        })
    }

    /// Remove `id` if it is still expired and close it.
    fn expire(&self, id: &str) -> bool {
        let max_idle = self.config.max_idle_secs;
        match self.sessions.remove_if(id, |_, session| session.is_expired(max_idle)) {
            Some((_, session)) => {
                session.close();
                debug!(session = %id, "http session expired");
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("sessions", &self.len())
            .field("max_idle_secs", &self.config.max_idle_secs)
            .finish()
    }
}

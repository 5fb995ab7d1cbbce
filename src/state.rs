//! Application state: config, generation backend, conversation store, and
//! the registry of per-learner session tasks.
//!
//! Sessions are created lazily on first use. A session with no commands for
//! `session_idle_secs` shuts itself down; its entry is replaced on the owner's
//! next request and swept when any new session is inserted.

use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::backend::{self, GenerationBackend};
use crate::config::{load_config_from_env, AppConfig};
use crate::pipeline::Pipeline;
use crate::session::SessionHandle;
use crate::store::{ConversationStore, MemoryStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn GenerationBackend>,
    pub store: Arc<dyn ConversationStore>,
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl AppState {
    /// Build state from env: load config, pick the backend, start an empty store.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let config = load_config_from_env();
        info!(
            target: "studyquest",
            max_attempts = config.pipeline.max_attempts,
            retry_base_delay_ms = config.pipeline.retry_base_delay_ms,
            max_pending = config.pipeline.max_pending,
            "Pipeline settings"
        );
        Self::with_parts(config, backend::from_env(), Arc::new(MemoryStore::new()))
    }

    pub fn with_parts(
        config: AppConfig,
        backend: Arc<dyn GenerationBackend>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            backend,
            store,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The owner's session, spawning it on first use or after the previous
    /// one shut down idle. Inserting also drops every other closed session.
    #[instrument(level = "debug", skip(self))]
    pub async fn session(&self, owner_id: &str) -> SessionHandle {
        if let Some(s) = self.sessions.read().await.get(owner_id) {
            if !s.is_closed() {
                return s.clone();
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get(owner_id) {
            if !s.is_closed() {
                return s.clone();
            }
        }
        let before = sessions.len();
        sessions.retain(|_, h| !h.is_closed());
        if sessions.len() < before {
            debug!(target: "studyquest", evicted = before - sessions.len(), "Dropped idle sessions");
        }
        debug!(target: "studyquest", %owner_id, "Starting session");
        let pipeline = Pipeline::new(owner_id, self.backend.clone(), self.store.clone(), &self.config);
        let handle = SessionHandle::spawn(pipeline, self.config.pipeline.max_pending);
        sessions.insert(owner_id.to_string(), handle.clone());
        handle
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OfflineBackend;
    use std::time::Duration;

    fn state(idle_secs: u64) -> AppState {
        let mut config = AppConfig::default();
        config.pipeline.session_idle_secs = idle_secs;
        AppState::with_parts(config, Arc::new(OfflineBackend), Arc::new(MemoryStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_are_evicted() {
        let state = state(60);
        for i in 0..50 {
            state.session(&format!("learner-{i}")).await;
        }
        assert_eq!(state.session_count().await, 50);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let fresh = state.session("learner-new").await;
        assert_eq!(state.session_count().await, 1);
        assert!(!fresh.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn returning_learner_gets_a_working_session() {
        let state = state(60);
        let first = state.session("ana").await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(first.is_closed());

        let again = state.session("ana").await;
        assert!(!again.is_closed());
        let snap = again.snapshot().await.unwrap();
        assert!(snap.messages.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_is_reused() {
        let state = state(60);
        let a = state.session("ana").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        a.snapshot().await.unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        let b = state.session("ana").await;
        assert!(!a.is_closed());
        assert!(!b.is_closed());
        assert_eq!(state.session_count().await, 1);
    }
}

//! # Session Registry
//!
//! Tracks every call currently running in the process, enforces the
//! concurrent session limit, and serves the data behind
//! `GET /api/v1/sessions`.
//!
//! ## Thread Safety:
//! A `tokio::sync::RwLock` guards the map: many readers (status endpoints)
//! or one writer (a call starting or ending) at a time. The limit lives in an
//! atomic so a config update can change it without taking the lock.

use crate::audio::codec::AudioFormat;
use crate::error::{AppError, AppResult};
use crate::relay::events::SessionContext;
use crate::relay::supervisor::ConnectionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

/// One registered call.
#[derive(Debug)]
struct SessionEntry {
    tenant_id: String,
    customer_phone: Option<String>,
    client_format: AudioFormat,
    created_at: DateTime<Utc>,
    connection: watch::Receiver<ConnectionState>,
}

/// Public view of a running call.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub tenant_id: String,
    pub customer_phone: Option<String>,
    pub client_format: AudioFormat,
    pub connection_state: ConnectionState,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Totals across all calls.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub by_connection_state: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_concurrent_sessions: AtomicUsize,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
        }
    }

    /// Claim a slot for a new call.
    ///
    /// ## Returns:
    /// - **Ok(())**: the call is registered and counts against the limit
    /// - **Err(Unavailable)**: the limit is reached
    /// - **Err(BadRequest)**: the session ID is already registered
    pub async fn register(
        &self,
        ctx: &SessionContext,
        connection: watch::Receiver<ConnectionState>,
    ) -> AppResult<()> {
        let mut sessions = self.sessions.write().await;
        let max = self.max_sessions();

        if sessions.len() >= max {
            warn!(session_id = %ctx.session_id, max, "Session limit reached");
            return Err(AppError::Unavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                max
            )));
        }

        if sessions.contains_key(&ctx.session_id) {
            return Err(AppError::BadRequest(format!(
                "Session ID '{}' already exists",
                ctx.session_id
            )));
        }

        sessions.insert(
            ctx.session_id.clone(),
            SessionEntry {
                tenant_id: ctx.tenant_id.clone(),
                customer_phone: ctx.customer_phone.clone(),
                client_format: ctx.client_format,
                created_at: ctx.started_at,
                connection,
            },
        );
        debug!(session_id = %ctx.session_id, active = sessions.len(), "Session registered");
        Ok(())
    }

    /// Release a call's slot. Returns whether it was registered.
    pub async fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id, "Session removed");
        }
        removed
    }

    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Change the limit for future registrations; running calls are kept.
    pub fn set_max_sessions(&self, max: usize) {
        self.max_concurrent_sessions.store(max, Ordering::Relaxed);
    }

    /// Running calls, oldest first.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let now = Utc::now();

        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(session_id, entry)| SessionInfo {
                session_id: session_id.clone(),
                tenant_id: entry.tenant_id.clone(),
                customer_phone: entry.customer_phone.clone(),
                client_format: entry.client_format,
                connection_state: *entry.connection.borrow(),
                created_at: entry.created_at,
                duration_seconds: now.signed_duration_since(entry.created_at).num_milliseconds() as f64
                    / 1000.0,
            })
            .collect();

        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.list().await.into_iter().find(|info| info.session_id == session_id)
    }

    pub async fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().await;
        let mut by_connection_state = HashMap::new();

        for entry in sessions.values() {
            let state = *entry.connection.borrow();
            *by_connection_state.entry(state.as_str().to_string()).or_insert(0) += 1;
        }

        RegistrySummary {
            active_sessions: sessions.len(),
            max_sessions: self.max_sessions(),
            by_connection_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(id: &str) -> SessionContext {
        SessionContext::new(id, "acme", None, AudioFormat::Pcm16)
    }

    #[tokio::test]
    async fn test_enforces_session_limit() {
        let registry = SessionRegistry::new(2);
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);

        registry.register(&ctx("a"), rx.clone()).await.unwrap();
        registry.register(&ctx("b"), rx.clone()).await.unwrap();
        let err = registry.register(&ctx("c"), rx.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::Unavailable(_)));

        assert!(registry.remove("a").await);
        assert!(!registry.remove("a").await);
        registry.register(&ctx("c"), rx).await.unwrap();
        assert_eq!(registry.active_count().await, 2);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_ids() {
        let registry = SessionRegistry::new(4);
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);

        registry.register(&ctx("a"), rx.clone()).await.unwrap();
        let err = registry.register(&ctx("a"), rx).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_reports_live_connection_state() {
        let registry = SessionRegistry::new(4);
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        registry.register(&ctx("a"), rx).await.unwrap();

        tx.send_replace(ConnectionState::Degraded);

        let info = registry.get("a").await.unwrap();
        assert_eq!(info.connection_state, ConnectionState::Degraded);
        assert_eq!(info.tenant_id, "acme");

        let summary = registry.summary().await;
        assert_eq!(summary.active_sessions, 1);
        assert_eq!(summary.by_connection_state.get("degraded"), Some(&1));
    }

    #[tokio::test]
    async fn test_limit_can_change_at_runtime() {
        let registry = SessionRegistry::new(1);
        let (_tx, rx) = watch::channel(ConnectionState::Disconnected);
        registry.register(&ctx("a"), rx.clone()).await.unwrap();
        assert!(registry.register(&ctx("b"), rx.clone()).await.is_err());

        registry.set_max_sessions(2);
        registry.register(&ctx("b"), rx).await.unwrap();
        assert_eq!(registry.summary().await.max_sessions, 2);
    }
}

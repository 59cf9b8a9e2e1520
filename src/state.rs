//! # Application State Management
//!
//! State shared by every HTTP handler and every call WebSocket.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! Every actix worker gets a clone of `AppState`; the `Arc`s inside make
//! those clones point at the same config, metrics and registry.
//!
//! ### RwLock for config
//! Config is read by every new session and written only by
//! `PUT /api/v1/config`, so many readers or one writer fits well.
//!
//! ### Atomics for metrics
//! Relay counters are bumped when calls end. Plain `AtomicU64`s let that
//! happen without any lock.

use crate::config::AppConfig;
use crate::relay::events::SessionSummary;
use crate::relay::registry::SessionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Process-wide relay counters
    pub metrics: Arc<RelayMetrics>,

    /// Running calls and the concurrency limit
    pub registry: Arc<SessionRegistry>,

    pub start_time: Instant,
}

/// Totals folded in from every finished call, plus live session counters.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_rejected: AtomicU64,
    user_audio_ms: AtomicU64,
    agent_audio_ms: AtomicU64,
    barge_in_frames: AtomicU64,
    dropped_samples: AtomicU64,
    degraded_events: AtomicU64,
    restored_events: AtomicU64,
    underruns: AtomicU64,
    overflows: AtomicU64,
    transcode_failures: AtomicU64,
    errors: AtomicU64,
}

/// Serializable copy of `RelayMetrics`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayMetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_rejected: u64,
    pub user_audio_ms: u64,
    pub agent_audio_ms: u64,
    pub barge_in_frames: u64,
    pub dropped_samples: u64,
    pub degraded_events: u64,
    pub restored_events: u64,
    pub underruns: u64,
    pub overflows: u64,
    pub transcode_failures: u64,
    pub errors: u64,
}

impl RelayMetrics {
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_rejected(&self) {
        self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished call into the totals.
    pub fn record_summary(&self, summary: &SessionSummary) {
        let add = |counter: &AtomicU64, value: u64| {
            counter.fetch_add(value, Ordering::Relaxed);
        };

        add(&self.sessions_completed, 1);
        add(&self.user_audio_ms, summary.user_audio_ms);
        add(&self.agent_audio_ms, summary.agent_audio_ms);
        add(&self.barge_in_frames, summary.barge_in_frames);
        add(&self.dropped_samples, summary.dropped_samples);
        add(&self.degraded_events, summary.degraded_events);
        add(&self.restored_events, summary.restored_events);
        add(&self.underruns, summary.underruns);
        add(&self.overflows, summary.overflows);
        add(&self.transcode_failures, summary.transcode_failures);
        add(&self.errors, summary.errors);
    }

    pub fn snapshot(&self) -> RelayMetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        RelayMetricsSnapshot {
            sessions_started: load(&self.sessions_started),
            sessions_completed: load(&self.sessions_completed),
            sessions_rejected: load(&self.sessions_rejected),
            user_audio_ms: load(&self.user_audio_ms),
            agent_audio_ms: load(&self.agent_audio_ms),
            barge_in_frames: load(&self.barge_in_frames),
            dropped_samples: load(&self.dropped_samples),
            degraded_events: load(&self.degraded_events),
            restored_events: load(&self.restored_events),
            underruns: load(&self.underruns),
            overflows: load(&self.overflows),
            transcode_failures: load(&self.transcode_failures),
            errors: load(&self.errors),
        }
    }
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = SessionRegistry::new(config.performance.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RelayMetrics::default()),
            registry: Arc::new(registry),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Poisoning:
    /// A writer never panics while holding the lock (it only assigns a
    /// validated value), so a poisoned lock still holds a valid config and
    /// is read through.
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the configuration after validating it.
    ///
    /// The session limit takes effect immediately; every other setting
    /// applies to calls started afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;

        self.registry
            .set_max_sessions(new_config.performance.max_concurrent_sessions);
        match self.config.write() {
            Ok(mut config) => *config = new_config,
            Err(poisoned) => *poisoned.into_inner() = new_config,
        }
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_folds_into_metrics() {
        let metrics = RelayMetrics::default();
        metrics.session_started();
        metrics.record_summary(&SessionSummary {
            user_audio_ms: 1200,
            agent_audio_ms: 800,
            barge_in_frames: 3,
            transcode_failures: 1,
            ..SessionSummary::default()
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.sessions_completed, 1);
        assert_eq!(snapshot.user_audio_ms, 1200);
        assert_eq!(snapshot.barge_in_frames, 3);
        assert_eq!(snapshot.transcode_failures, 1);
    }

    #[test]
    fn test_update_config_validates_and_resizes_registry() {
        let state = AppState::new(AppConfig::default());

        let mut bad = state.get_config();
        bad.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.registry.max_sessions(), 50);

        let mut good = state.get_config();
        good.performance.max_concurrent_sessions = 5;
        assert!(state.update_config(good).is_ok());
        assert_eq!(state.registry.max_sessions(), 5);
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 5);
    }
}

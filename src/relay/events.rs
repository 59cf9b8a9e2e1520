//! # Session Events
//!
//! The relay reports what happens during a call as discrete events. Where
//! they end up is not the relay's business: the sink might log them, count
//! them, or forward them to a transcript store.
//!
//! ## Provided Sinks:
//! - **TracingSink**: one structured log line per event
//! - **SessionRecorder**: in-memory counters, turned into a `SessionSummary`
//!   when the call ends
//! - **FanoutSink**: forwards to several sinks in order

use crate::audio::codec::AudioFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity of one call, passed explicitly to everything that logs or records.
#[derive(Debug, Clone, Serialize)]
pub struct SessionContext {
    pub session_id: String,
    pub tenant_id: String,
    pub customer_phone: Option<String>,
    pub client_format: AudioFormat,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        tenant_id: impl Into<String>,
        customer_phone: Option<String>,
        client_format: AudioFormat,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            tenant_id: tenant_id.into(),
            customer_phone,
            client_format,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Client audio forwarded towards the sidecar
    UserAudioReceived { duration_ms: u64, bytes: usize },
    /// Agent audio handed to the client
    AgentAudioSent { duration_ms: u64, bytes: usize },
    /// A sidecar frame was dropped because the client was talking
    BargeIn { dropped_samples: usize },
    ConnectionDegraded { reason: String },
    ConnectionRestored,
    BufferUnderrun,
    BufferOverflow { trimmed_samples: usize },
    Error { kind: String, message: String },
}

/// Receives session events.
///
/// `record` is called from the relay's audio tasks, so implementations must
/// be quick and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, ctx: &SessionContext, event: &SessionEvent);
}

/// Writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, ctx: &SessionContext, event: &SessionEvent) {
        let session_id = ctx.session_id.as_str();
        let tenant_id = ctx.tenant_id.as_str();

        match event {
            SessionEvent::UserAudioReceived { duration_ms, bytes } => {
                debug!(session_id, tenant_id, duration_ms, bytes, "User audio received");
            }
            SessionEvent::AgentAudioSent { duration_ms, bytes } => {
                debug!(session_id, tenant_id, duration_ms, bytes, "Agent audio sent");
            }
            SessionEvent::BargeIn { dropped_samples } => {
                debug!(session_id, tenant_id, dropped_samples, "Barge-in: dropped agent audio");
            }
            SessionEvent::ConnectionDegraded { reason } => {
                warn!(session_id, tenant_id, %reason, "Session degraded to text-only");
            }
            SessionEvent::ConnectionRestored => {
                info!(session_id, tenant_id, "Sidecar connection restored");
            }
            SessionEvent::BufferUnderrun => {
                debug!(session_id, tenant_id, "Playback buffer underrun");
            }
            SessionEvent::BufferOverflow { trimmed_samples } => {
                debug!(session_id, tenant_id, trimmed_samples, "Playback buffer trimmed");
            }
            SessionEvent::Error { kind, message } => {
                warn!(session_id, tenant_id, %kind, %message, "Session error");
            }
        }
    }
}

/// End-of-call totals for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub tenant_id: String,
    pub duration_ms: u64,
    pub user_audio_ms: u64,
    pub user_audio_bytes: u64,
    pub agent_audio_ms: u64,
    pub agent_audio_bytes: u64,
    pub barge_in_frames: u64,
    pub dropped_samples: u64,
    pub degraded_events: u64,
    pub restored_events: u64,
    pub underruns: u64,
    pub overflows: u64,
    pub trimmed_samples: u64,
    pub errors: u64,
    pub transcode_failures: u64,
}

/// Aggregates events for a single session.
///
/// ## Rust Concepts:
/// - **Atomics instead of a Mutex**: `record` runs on the audio tasks, and a
///   counter bump must never wait behind another task
#[derive(Debug, Default)]
pub struct SessionRecorder {
    user_audio_ms: AtomicU64,
    user_audio_bytes: AtomicU64,
    agent_audio_ms: AtomicU64,
    agent_audio_bytes: AtomicU64,
    barge_in_frames: AtomicU64,
    dropped_samples: AtomicU64,
    degraded_events: AtomicU64,
    restored_events: AtomicU64,
    underruns: AtomicU64,
    overflows: AtomicU64,
    trimmed_samples: AtomicU64,
    errors: AtomicU64,
    transcode_failures: AtomicU64,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the counters for `ctx`, with the duration measured up to now.
    pub fn summary(&self, ctx: &SessionContext) -> SessionSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let duration_ms = Utc::now()
            .signed_duration_since(ctx.started_at)
            .num_milliseconds()
            .max(0) as u64;

        SessionSummary {
            session_id: ctx.session_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            duration_ms,
            user_audio_ms: load(&self.user_audio_ms),
            user_audio_bytes: load(&self.user_audio_bytes),
            agent_audio_ms: load(&self.agent_audio_ms),
            agent_audio_bytes: load(&self.agent_audio_bytes),
            barge_in_frames: load(&self.barge_in_frames),
            dropped_samples: load(&self.dropped_samples),
            degraded_events: load(&self.degraded_events),
            restored_events: load(&self.restored_events),
            underruns: load(&self.underruns),
            overflows: load(&self.overflows),
            trimmed_samples: load(&self.trimmed_samples),
            errors: load(&self.errors),
            transcode_failures: load(&self.transcode_failures),
        }
    }
}

impl EventSink for SessionRecorder {
    fn record(&self, _ctx: &SessionContext, event: &SessionEvent) {
        let add = |counter: &AtomicU64, value: u64| {
            counter.fetch_add(value, Ordering::Relaxed);
        };

        match event {
            SessionEvent::UserAudioReceived { duration_ms, bytes } => {
                add(&self.user_audio_ms, *duration_ms);
                add(&self.user_audio_bytes, *bytes as u64);
            }
            SessionEvent::AgentAudioSent { duration_ms, bytes } => {
                add(&self.agent_audio_ms, *duration_ms);
                add(&self.agent_audio_bytes, *bytes as u64);
            }
            SessionEvent::BargeIn { dropped_samples } => {
                add(&self.barge_in_frames, 1);
                add(&self.dropped_samples, *dropped_samples as u64);
            }
            SessionEvent::ConnectionDegraded { .. } => add(&self.degraded_events, 1),
            SessionEvent::ConnectionRestored => add(&self.restored_events, 1),
            SessionEvent::BufferUnderrun => add(&self.underruns, 1),
            SessionEvent::BufferOverflow { trimmed_samples } => {
                add(&self.overflows, 1);
                add(&self.trimmed_samples, *trimmed_samples as u64);
            }
            SessionEvent::Error { kind, .. } => {
                add(&self.errors, 1);
                if kind == "transcode_failure" {
                    add(&self.transcode_failures, 1);
                }
            }
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for FanoutSink {
    fn record(&self, ctx: &SessionContext, event: &SessionEvent) {
        for sink in &self.sinks {
            sink.record(ctx, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new("session-1", "acme", Some("+15550100".to_string()), AudioFormat::Pcm16)
    }

    #[test]
    fn test_recorder_aggregates_events() {
        let recorder = SessionRecorder::new();
        let ctx = ctx();

        recorder.record(&ctx, &SessionEvent::UserAudioReceived { duration_ms: 20, bytes: 640 });
        recorder.record(&ctx, &SessionEvent::UserAudioReceived { duration_ms: 20, bytes: 640 });
        recorder.record(&ctx, &SessionEvent::AgentAudioSent { duration_ms: 20, bytes: 100 });
        recorder.record(&ctx, &SessionEvent::BargeIn { dropped_samples: 320 });
        recorder.record(&ctx, &SessionEvent::BufferOverflow { trimmed_samples: 260 });
        recorder.record(&ctx, &SessionEvent::BufferUnderrun);
        recorder.record(
            &ctx,
            &SessionEvent::Error {
                kind: "transcode_failure".to_string(),
                message: "ffmpeg exited".to_string(),
            },
        );

        let summary = recorder.summary(&ctx);
        assert_eq!(summary.session_id, "session-1");
        assert_eq!(summary.user_audio_ms, 40);
        assert_eq!(summary.user_audio_bytes, 1280);
        assert_eq!(summary.agent_audio_bytes, 100);
        assert_eq!(summary.barge_in_frames, 1);
        assert_eq!(summary.dropped_samples, 320);
        assert_eq!(summary.overflows, 1);
        assert_eq!(summary.trimmed_samples, 260);
        assert_eq!(summary.underruns, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.transcode_failures, 1);
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let first = Arc::new(SessionRecorder::new());
        let second = Arc::new(SessionRecorder::new());
        let fanout = FanoutSink::new()
            .with(first.clone())
            .with(Arc::new(TracingSink))
            .with(second.clone());

        let ctx = ctx();
        fanout.record(&ctx, &SessionEvent::ConnectionDegraded { reason: "refused".to_string() });

        assert_eq!(first.summary(&ctx).degraded_events, 1);
        assert_eq!(second.summary(&ctx).degraded_events, 1);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(SessionEvent::BargeIn { dropped_samples: 160 }).unwrap();
        assert_eq!(json["type"], "barge_in");
        assert_eq!(json["dropped_samples"], 160);
    }
}

//! # Barge-In Detection
//!
//! Tracks whether the caller is talking so that agent audio can be dropped
//! while they interrupt. Every client audio chunk counts as activity; the
//! caller is considered quiet again once a short window passes without any.
//!
//! ## Concurrency:
//! The uplink task writes, the sidecar pump reads. The whole state is one
//! timestamp, so the reader never writes and cannot undo a concurrent mark.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default quiet window after the last client chunk.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(100);

/// `last_activity_us` value before the client has sent any audio.
const NEVER_SPOKE: u64 = u64::MAX;

/// Shared timestamp describing client speech activity.
///
/// ## Layout:
/// - **last_activity_us**: microseconds since `epoch` of the latest chunk,
///   or `NEVER_SPOKE`
/// - **dropped_frames**: agent frames suppressed while the client was speaking
#[derive(Debug)]
pub struct BargeInDetector {
    epoch: Instant,
    quiet_window: Duration,
    last_activity_us: AtomicU64,
    dropped_frames: AtomicU64,
}

impl BargeInDetector {
    pub fn new(quiet_window: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            quiet_window,
            last_activity_us: AtomicU64::new(NEVER_SPOKE),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Record that a client audio chunk just arrived.
    pub fn mark_client_activity(&self) {
        self.last_activity_us.store(self.elapsed_us(), Ordering::Release);
    }

    /// Whether the client spoke within the quiet window.
    ///
    /// ## Expiry:
    /// No timer task clears anything; every read compares the last chunk's
    /// timestamp with the window. The outcome is the same as a scheduled
    /// clear, without a task per chunk.
    pub fn is_client_speaking(&self) -> bool {
        let last_us = self.last_activity_us.load(Ordering::Acquire);
        if last_us == NEVER_SPOKE {
            return false;
        }

        let quiet_for = Duration::from_micros(self.elapsed_us().saturating_sub(last_us));
        quiet_for < self.quiet_window
    }

    /// Count one agent frame suppressed by the gate.
    pub fn record_drop(&self) -> u64 {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn quiet_window(&self) -> Duration {
        self.quiet_window
    }

    fn elapsed_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

impl Default for BargeInDetector {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_quiet_by_default() {
        let detector = BargeInDetector::default();
        assert!(!detector.is_client_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_expires_after_window() {
        let detector = BargeInDetector::new(Duration::from_millis(100));
        detector.mark_client_activity();
        assert!(detector.is_client_speaking());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(detector.is_client_speaking());

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(!detector.is_client_speaking());
        // Stays quiet on repeated reads
        assert!(!detector.is_client_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_activity_extends_window() {
        let detector = BargeInDetector::new(Duration::from_millis(100));
        detector.mark_client_activity();

        tokio::time::advance(Duration::from_millis(80)).await;
        detector.mark_client_activity();

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(detector.is_client_speaking());

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(!detector.is_client_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_at_epoch_counts() {
        let detector = BargeInDetector::new(Duration::from_millis(100));
        detector.mark_client_activity();
        assert!(detector.is_client_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_after_expired_read_is_not_lost() {
        let detector = BargeInDetector::new(Duration::from_millis(100));
        detector.mark_client_activity();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!detector.is_client_speaking());

        // The expired read must not leave anything behind that hides this mark
        detector.mark_client_activity();
        assert!(detector.is_client_speaking());
        assert!(detector.is_client_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_counter() {
        let detector = BargeInDetector::default();
        assert_eq!(detector.record_drop(), 1);
        assert_eq!(detector.record_drop(), 2);
        assert_eq!(detector.dropped_frames(), 2);
    }
}

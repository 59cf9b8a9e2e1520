//! # Jitter Buffer / Playback Scheduler
//!
//! Sidecar audio arrives in bursts; the client needs a steady stream of
//! fixed-size blocks. This buffer sits between the two: the sidecar pump
//! pushes frames whenever they arrive, and the emit timer pulls one block
//! per tick.
//!
//! ## Adaptive Thresholds:
//! - **initial**: samples that must be buffered before playback starts
//! - **partial**: extra silence played after a (re)start; grows on every
//!   underrun so a jittery link converges to a larger safety margin
//! - **max buffer**: slack tolerated before trimming back to the live edge;
//!   grows on every overflow so repeated bursts stop being trimmed
//!
//! ## Click-Free Transitions:
//! The first audible block after a start is faded in, and the last partial
//! block before an underrun is faded out. Hard jumps in amplitude are heard
//! as clicks.

use crate::audio::frame::AudioFrame;
use serde::Serialize;
use std::collections::VecDeque;

/// Fixed parameters of a jitter buffer, all in interleaved samples.
///
/// ## Fields:
/// - `initial_buffer_samples`: playback start threshold (never adapts)
/// - `partial_buffer_samples`: starting value of the adaptive partial buffer
/// - `partial_increment` / `partial_ceiling`: growth step and cap on underrun
/// - `max_buffer_samples`: starting value of the adaptive overflow slack
/// - `max_increment` / `max_ceiling`: growth step and cap on overflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JitterSettings {
    pub initial_buffer_samples: usize,
    pub partial_buffer_samples: usize,
    pub partial_increment: usize,
    pub partial_ceiling: usize,
    pub max_buffer_samples: usize,
    pub max_increment: usize,
    pub max_ceiling: usize,
}

impl Default for JitterSettings {
    /// Defaults for 16kHz mono: 80ms start, 10ms partial/max, 5ms steps, 80ms caps.
    fn default() -> Self {
        Self {
            initial_buffer_samples: 1280,
            partial_buffer_samples: 160,
            partial_increment: 80,
            partial_ceiling: 1280,
            max_buffer_samples: 160,
            max_increment: 80,
            max_ceiling: 1280,
        }
    }
}

/// Current values of the thresholds, including the adaptive ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferingThresholds {
    pub initial_buffer_samples: usize,
    pub partial_buffer_samples: usize,
    pub max_buffer_samples: usize,
}

impl BufferingThresholds {
    fn from_settings(settings: &JitterSettings) -> Self {
        Self {
            initial_buffer_samples: settings.initial_buffer_samples,
            partial_buffer_samples: settings.partial_buffer_samples,
            max_buffer_samples: settings.max_buffer_samples,
        }
    }

    /// Buffered samples above which an ingest trims the queue.
    pub fn overflow_limit(&self) -> usize {
        self.max_buffer_samples + self.partial_buffer_samples + self.initial_buffer_samples
    }

    /// Buffered samples left after an overflow trim.
    pub fn trim_target(&self) -> usize {
        self.initial_buffer_samples + self.partial_buffer_samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Buffering,
    Playing,
}

/// What a `push` did besides storing the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Playback started with this frame
    pub started: bool,
    /// Samples discarded from the front to catch up with the live edge
    pub trimmed: usize,
}

/// What kind of block a `pull` produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Not enough audio buffered yet; the block is silence
    Buffering,
    /// Playing, but still counting down the partial buffer; the block is silence
    Countdown,
    /// A full block of audio
    Audio,
    /// Only `filled` samples were available; faded out and padded with silence
    Underrun { filled: usize },
}

/// Control signals accepted by the playback side.
#[derive(Debug)]
pub enum PlaybackCommand {
    /// Drop all buffered audio and adaptive state
    Reset,
    /// Append a new frame
    Push(AudioFrame),
}

/// Point-in-time view of the buffer for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JitterSnapshot {
    pub state: PlaybackState,
    pub buffered_samples: usize,
    pub remaining_partial_samples: usize,
    pub first_output_pending: bool,
    pub thresholds: BufferingThresholds,
    pub underruns: u64,
    pub overflows: u64,
    /// How long the oldest queued frame has been waiting
    pub oldest_frame_age_ms: Option<u64>,
}

/// Ordered frames plus a read offset into the head frame.
///
/// ## Invariant:
/// `offset < frames[0].len()` whenever the queue is non-empty, and
/// `offset == 0` when it is empty. `total` is always the sum of frame
/// lengths, so `buffered()` never has to walk the queue.
#[derive(Debug, Default)]
struct FrameQueue {
    frames: VecDeque<AudioFrame>,
    offset: usize,
    total: usize,
}

impl FrameQueue {
    fn push(&mut self, frame: AudioFrame) {
        if frame.is_empty() {
            return;
        }
        self.total += frame.len();
        self.frames.push_back(frame);
    }

    fn buffered(&self) -> usize {
        self.total - self.offset
    }

    fn oldest_age_ms(&self) -> Option<u64> {
        self.frames
            .front()
            .map(|head| head.arrived_at().elapsed().as_millis() as u64)
    }

    /// Copy up to `out.len()` samples into `out`, consuming them. Returns the count copied.
    fn read_into(&mut self, out: &mut [i16]) -> usize {
        let mut written = 0;

        while written < out.len() {
            let Some(head) = self.frames.front() else {
                break;
            };
            let available = &head.samples()[self.offset..];
            let take = available.len().min(out.len() - written);
            out[written..written + take].copy_from_slice(&available[..take]);
            written += take;
            self.advance(take);
        }

        written
    }

    /// Discard up to `count` samples from the front. Returns the count discarded.
    fn discard(&mut self, count: usize) -> usize {
        let mut discarded = 0;

        while discarded < count {
            let Some(head) = self.frames.front() else {
                break;
            };
            let take = (head.len() - self.offset).min(count - discarded);
            discarded += take;
            self.advance(take);
        }

        discarded
    }

    fn advance(&mut self, count: usize) {
        self.offset += count;
        if let Some(head) = self.frames.front() {
            if self.offset >= head.len() {
                let len = head.len();
                self.frames.pop_front();
                self.total -= len;
                self.offset = 0;
            }
        }
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.offset = 0;
        self.total = 0;
    }
}

/// Adaptive jitter buffer for one session's downlink audio.
///
/// ## Ownership:
/// Not internally synchronized. The relay session wraps it in a
/// `tokio::sync::Mutex` shared by exactly two tasks: the sidecar pump
/// (push) and the emit timer (pull).
#[derive(Debug)]
pub struct JitterBuffer {
    settings: JitterSettings,
    thresholds: BufferingThresholds,
    queue: FrameQueue,
    state: PlaybackState,
    remaining_partial_samples: usize,
    first_output_pending: bool,
    underruns: u64,
    overflows: u64,
}

impl JitterBuffer {
    pub fn new(settings: JitterSettings) -> Self {
        Self {
            thresholds: BufferingThresholds::from_settings(&settings),
            settings,
            queue: FrameQueue::default(),
            state: PlaybackState::Buffering,
            remaining_partial_samples: 0,
            first_output_pending: false,
            underruns: 0,
            overflows: 0,
        }
    }

    /// Append a frame, start playback once the initial threshold is met,
    /// and trim back to the live edge if too much has piled up.
    ///
    /// ## Overflow Control:
    /// When buffered samples exceed `max + partial + initial`, the oldest
    /// samples are dropped until `initial + partial` remain. The max buffer
    /// then grows by one step (up to its ceiling), so a link that keeps
    /// bursting gets more slack before the next trim.
    pub fn push(&mut self, frame: AudioFrame) -> PushOutcome {
        let mut outcome = PushOutcome::default();
        self.queue.push(frame);

        if self.state == PlaybackState::Buffering
            && self.queue.buffered() >= self.thresholds.initial_buffer_samples
        {
            self.start();
            outcome.started = true;
        }

        if self.queue.buffered() > self.thresholds.overflow_limit() {
            let excess = self.queue.buffered() - self.thresholds.trim_target();
            outcome.trimmed = self.queue.discard(excess);
            self.thresholds.max_buffer_samples = (self.thresholds.max_buffer_samples
                + self.settings.max_increment)
                .min(self.settings.max_ceiling);
            self.overflows += 1;
        }

        outcome
    }

    /// Produce exactly `block_size` samples for the output clock.
    ///
    /// ## Behavior:
    /// - **Buffering**: silence
    /// - **Playing, partial countdown > 0**: silence, countdown reduced by `block_size`
    /// - **Playing**: up to `block_size` samples from the queue; the first
    ///   audible block after a start is faded in
    /// - **Underrun** (fewer than `block_size` available): the partial block is
    ///   faded out, the partial buffer grows by one step, and the buffer goes
    ///   back to buffering until the initial threshold is crossed again
    pub fn pull(&mut self, block_size: usize) -> (Vec<i16>, PullOutcome) {
        let mut block = vec![0i16; block_size];

        if self.state != PlaybackState::Playing {
            return (block, PullOutcome::Buffering);
        }

        if self.remaining_partial_samples > 0 {
            self.remaining_partial_samples =
                self.remaining_partial_samples.saturating_sub(block_size);
            return (block, PullOutcome::Countdown);
        }

        let filled = self.queue.read_into(&mut block);

        if self.first_output_pending && filled > 0 {
            fade_in(&mut block[..filled]);
            self.first_output_pending = false;
        }

        if filled < block_size {
            fade_out(&mut block[..filled]);
            self.thresholds.partial_buffer_samples = (self.thresholds.partial_buffer_samples
                + self.settings.partial_increment)
                .min(self.settings.partial_ceiling);
            self.state = PlaybackState::Buffering;
            self.first_output_pending = false;
            self.underruns += 1;
            return (block, PullOutcome::Underrun { filled });
        }

        (block, PullOutcome::Audio)
    }

    /// Clear all audio and restore every threshold to its configured default.
    pub fn reset(&mut self) {
        *self = Self::new(self.settings);
    }

    /// Apply a playback control signal.
    pub fn apply(&mut self, command: PlaybackCommand) -> PushOutcome {
        match command {
            PlaybackCommand::Reset => {
                self.reset();
                PushOutcome::default()
            }
            PlaybackCommand::Push(frame) => self.push(frame),
        }
    }

    pub fn buffered_samples(&self) -> usize {
        self.queue.buffered()
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn thresholds(&self) -> BufferingThresholds {
        self.thresholds
    }

    pub fn snapshot(&self) -> JitterSnapshot {
        JitterSnapshot {
            state: self.state,
            buffered_samples: self.queue.buffered(),
            remaining_partial_samples: self.remaining_partial_samples,
            first_output_pending: self.first_output_pending,
            thresholds: self.thresholds,
            underruns: self.underruns,
            overflows: self.overflows,
            oldest_frame_age_ms: self.queue.oldest_age_ms(),
        }
    }

    fn start(&mut self) {
        self.state = PlaybackState::Playing;
        self.first_output_pending = true;
        self.remaining_partial_samples = self.thresholds.partial_buffer_samples;
    }
}

/// Linear ramp from silence to full scale across the slice.
fn fade_in(samples: &mut [i16]) {
    let len = samples.len() as f32;
    for (i, sample) in samples.iter_mut().enumerate() {
        *sample = (*sample as f32 * (i as f32 / len)) as i16;
    }
}

/// Linear ramp from full scale down to silence across the slice.
fn fade_out(samples: &mut [i16]) {
    let len = samples.len() as f32;
    for (i, sample) in samples.iter_mut().enumerate() {
        *sample = (*sample as f32 * ((len - i as f32) / len)) as i16;
    }
}

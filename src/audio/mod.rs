//! # Audio Module
//!
//! Audio building blocks used by every relay session. Nothing in here knows
//! about sockets or sidecars; each piece is driven by the session tasks.
//!
//! ## Key Components:
//! - **Frames**: PCM sample frames, format description, byte/sample helpers
//! - **Codec**: streaming transcoders between client formats and PCM
//! - **Barge-In**: lock-free "is the caller talking" detector
//! - **Jitter**: adaptive buffer that turns bursty sidecar output into a steady block stream
//!
//! ## Audio Format on the Sidecar Side:
//! - **Sample Rate**: configurable, 16kHz by default
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: configurable, mono by default
//! - **Encoding**: Little-endian signed integers

pub mod barge_in; // Client speech activity
pub mod codec; // Client format <-> PCM pipelines
pub mod frame; // Frames and PCM helpers
pub mod jitter; // Playback buffering and scheduling

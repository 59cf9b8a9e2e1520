//! # Audio Frames and PCM Helpers
//!
//! Every stage of the relay that touches raw audio works on signed 16-bit
//! little-endian PCM. This module owns the in-memory frame type and the
//! byte <-> sample conversions used on both sides of the relay.
//!
//! ## Key Types:
//! - **AudioFrame**: an immutable run of samples tagged with its arrival time
//! - **PcmSpec**: the negotiated sample rate and channel count
//! - **PcmAssembler**: stitches arbitrarily sized byte chunks into whole samples

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use tokio::time::Instant;

/// Sample rate and channel layout of raw PCM on the sidecar side.
///
/// ## Rust Concepts:
/// - **Copy**: Two small integers, so it is passed around by value
/// - **Serialize/Deserialize**: Included in status messages and config dumps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmSpec {
    pub sample_rate: u32,
    pub channels: u8,
}

impl PcmSpec {
    pub fn new(sample_rate: u32, channels: u8) -> Self {
        Self { sample_rate, channels }
    }

    /// Convert a duration in milliseconds to an interleaved sample count.
    ///
    /// ## Example:
    /// 80ms of 16kHz mono audio: 80 * 16000 / 1000 = 1280 samples
    pub fn samples_for_ms(&self, ms: u64) -> usize {
        (ms * self.sample_rate as u64 * self.channels as u64 / 1000) as usize
    }

    /// Duration in milliseconds of `samples` interleaved samples.
    pub fn duration_ms(&self, samples: usize) -> u64 {
        let per_second = self.sample_rate as u64 * self.channels.max(1) as u64;
        if per_second == 0 {
            return 0;
        }
        samples as u64 * 1000 / per_second
    }

    /// Duration in milliseconds of a PCM s16le byte payload.
    pub fn bytes_duration_ms(&self, bytes: usize) -> u64 {
        self.duration_ms(bytes / 2)
    }
}

impl Default for PcmSpec {
    fn default() -> Self {
        Self::new(16000, 1)
    }
}

/// A run of PCM samples produced by the sidecar.
///
/// ## Ownership:
/// Frames are built once and then moved into the jitter buffer, which is
/// the only place that reads them afterwards. Nothing mutates a frame after
/// construction, so the samples are only exposed through a shared slice.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Vec<i16>,
    arrived_at: Instant,
}

impl AudioFrame {
    /// Create a frame stamped with the current time.
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples, arrived_at: Instant::now() }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn arrived_at(&self) -> Instant {
        self.arrived_at
    }
}

/// Reassembles a byte stream into whole 16-bit samples.
///
/// ## Why this exists:
/// WebSocket frames from the sidecar and reads from a transcoder pipe are
/// not guaranteed to end on a sample boundary. A chunk of 4097 bytes carries
/// 2048 samples plus half of the next one; the half is kept here and joined
/// with the first byte of the following chunk.
#[derive(Debug, Default)]
pub struct PcmAssembler {
    carry: Option<u8>,
}

impl PcmAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of little-endian PCM bytes and get back every complete sample.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<i16> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        if let Some(byte) = self.carry.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(chunk);

        if bytes.len() % 2 == 1 {
            self.carry = bytes.pop();
        }

        bytes_to_samples(&bytes)
    }

    /// Whether half a sample is waiting for the next chunk.
    pub fn has_pending(&self) -> bool {
        self.carry.is_some()
    }

    pub fn clear(&mut self) {
        self.carry = None;
    }
}

/// Decode little-endian PCM bytes into samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    samples
}

/// Encode samples as little-endian PCM bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_for_ms() {
        let spec = PcmSpec::new(16000, 1);
        assert_eq!(spec.samples_for_ms(80), 1280);
        assert_eq!(spec.samples_for_ms(10), 160);
        assert_eq!(spec.duration_ms(1280), 80);
        assert_eq!(spec.bytes_duration_ms(32000), 1000);

        let stereo = PcmSpec::new(48000, 2);
        assert_eq!(stereo.samples_for_ms(20), 1920);
    }

    #[test]
    fn test_assembler_carries_odd_byte() {
        let mut assembler = PcmAssembler::new();
        let bytes = samples_to_bytes(&[1000, -2000, 3000]);

        // Split in the middle of the second sample
        let first = assembler.push(&bytes[..3]);
        assert_eq!(first, vec![1000]);
        assert!(assembler.has_pending());

        let second = assembler.push(&bytes[3..]);
        assert_eq!(second, vec![-2000, 3000]);
        assert!(!assembler.has_pending());
    }

    #[test]
    fn test_assembler_single_bytes() {
        let mut assembler = PcmAssembler::new();
        let bytes = samples_to_bytes(&[i16::MIN, i16::MAX]);

        let mut collected = Vec::new();
        for byte in bytes {
            collected.extend(assembler.push(&[byte]));
        }
        assert_eq!(collected, vec![i16::MIN, i16::MAX]);
    }

    #[test]
    fn test_bytes_to_samples_ignores_trailing_byte() {
        let mut bytes = samples_to_bytes(&[42, -42]);
        bytes.push(0x7f);
        assert_eq!(bytes_to_samples(&bytes), vec![42, -42]);
    }
}

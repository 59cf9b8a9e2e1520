//! # Codec Transcoder
//!
//! Converts between the client's audio format and the raw PCM the sidecar
//! speaks. Both directions are streaming pipelines: chunks of any size go in,
//! chunks come out as soon as the codec produces them, and nothing waits for
//! end-of-stream.
//!
//! ## Backends:
//! - **Passthrough**: the client already sends PCM s16le, so chunks are
//!   forwarded unchanged by an in-process task
//! - **ffmpeg**: compressed formats (WebM/Opus, Ogg/Opus, WAV) run through a
//!   managed `ffmpeg` subprocess with owned stdin/stdout/stderr pipes
//!
//! ## Backpressure:
//! Both ends are bounded channels. A slow consumer stops the stdout reader,
//! the pipe fills, ffmpeg blocks, the stdin writer blocks, and finally
//! `TranscodeInput::push` waits. Nothing buffers without bound.
//!
//! ## Failure:
//! If the process exits before its input was closed, exits non-zero, or a
//! pipe breaks, the output stream yields a `RelayError::Transcode` for that
//! direction. Dropping the handles aborts the tasks and kills the process.

use crate::audio::frame::PcmSpec;
use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bytes read from the codec's stdout per chunk.
const READ_CHUNK_BYTES: usize = 4096;

/// How long to wait for the process to exit once its stdout has closed.
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Which way audio flows through a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client format -> PCM, heading to the sidecar
    Uplink,
    /// PCM -> client format, heading to the client
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => write!(f, "uplink"),
            Direction::Downlink => write!(f, "downlink"),
        }
    }
}

/// Audio formats a client can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// Raw signed 16-bit little-endian PCM at the sidecar rate
    Pcm16,
    /// Opus in a WebM container (browser MediaRecorder default)
    WebmOpus,
    /// Opus in an Ogg container
    OggOpus,
    /// WAV stream
    Wav,
}

impl AudioFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Pcm16 => "pcm16",
            AudioFormat::WebmOpus => "webm_opus",
            AudioFormat::OggOpus => "ogg_opus",
            AudioFormat::Wav => "wav",
        }
    }

    /// Whether the format needs a codec process at all.
    pub fn is_raw(&self) -> bool {
        matches!(self, AudioFormat::Pcm16)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pcm16" | "pcm_16" | "pcm" | "s16le" => Ok(AudioFormat::Pcm16),
            "webm_opus" | "webm" => Ok(AudioFormat::WebmOpus),
            "ogg_opus" | "ogg" | "opus" => Ok(AudioFormat::OggOpus),
            "wav" => Ok(AudioFormat::Wav),
            other => Err(format!("Unknown audio format: {}", other)),
        }
    }
}

/// Settings shared by every pipeline in the process.
#[derive(Debug, Clone)]
pub struct TranscoderSettings {
    /// Path or name of the ffmpeg binary
    pub ffmpeg_path: String,
    /// Opus bitrate for the downlink encoder, in ffmpeg syntax ("24k")
    pub opus_bitrate: String,
    /// Capacity of the input and output channels, in chunks
    pub channel_capacity: usize,
}

impl Default for TranscoderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            opus_bitrate: "24k".to_string(),
            channel_capacity: 32,
        }
    }
}

/// Aborts the pipeline's tasks when the owning handle is dropped.
///
/// The reader task owns the `Child`, and the child is spawned with
/// `kill_on_drop`, so aborting the task also kills the process.
#[derive(Debug)]
struct TaskGuard(Vec<JoinHandle<()>>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Write side of a pipeline.
#[derive(Debug)]
pub struct TranscodeInput {
    tx: mpsc::Sender<Vec<u8>>,
    direction: Direction,
}

impl TranscodeInput {
    /// Push a chunk into the pipeline, waiting while it is full.
    ///
    /// ## Errors:
    /// Returns `RelayError::Transcode` once the pipeline has stopped
    /// accepting input (process died, pipe broke, or the output was dropped).
    pub async fn push(&self, chunk: Vec<u8>) -> Result<(), RelayError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .await
            .map_err(|_| RelayError::transcode(self.direction, "pipeline is no longer accepting input"))
    }
}

/// Read side of a pipeline.
#[derive(Debug)]
pub struct TranscodeOutput {
    rx: mpsc::Receiver<Result<Vec<u8>, RelayError>>,
    _tasks: TaskGuard,
}

impl TranscodeOutput {
    /// Next transcoded chunk. `None` means the pipeline finished cleanly
    /// after its input was closed; a failure is reported as `Some(Err(..))`.
    pub async fn next(&mut self) -> Option<Result<Vec<u8>, RelayError>> {
        self.rx.recv().await
    }
}

/// Entry point for building pipelines.
pub struct Transcoder;

impl Transcoder {
    /// Start a streaming pipeline for one direction of a session.
    ///
    /// ## Parameters:
    /// - **direction**: `Uplink` decodes `format` to PCM, `Downlink` encodes PCM to `format`
    /// - **format**: the client's audio format
    /// - **pcm**: sample rate and channel count on the PCM side
    /// - **settings**: ffmpeg location, bitrate and channel sizes
    pub fn spawn(
        direction: Direction,
        format: AudioFormat,
        pcm: PcmSpec,
        settings: &TranscoderSettings,
    ) -> Result<(TranscodeInput, TranscodeOutput), RelayError> {
        if format.is_raw() {
            Ok(Self::spawn_passthrough(direction, settings.channel_capacity))
        } else {
            Self::spawn_ffmpeg(direction, format, pcm, settings)
        }
    }

    fn spawn_passthrough(direction: Direction, capacity: usize) -> (TranscodeInput, TranscodeOutput) {
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(capacity.max(1));
        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));

        let forward = tokio::spawn(async move {
            while let Some(chunk) = in_rx.recv().await {
                if out_tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
        });

        debug!(%direction, "Started passthrough pipeline");

        (
            TranscodeInput { tx: in_tx, direction },
            TranscodeOutput { rx: out_rx, _tasks: TaskGuard(vec![forward]) },
        )
    }

    fn spawn_ffmpeg(
        direction: Direction,
        format: AudioFormat,
        pcm: PcmSpec,
        settings: &TranscoderSettings,
    ) -> Result<(TranscodeInput, TranscodeOutput), RelayError> {
        let args = ffmpeg_args(direction, format, pcm, settings);

        let mut child = Command::new(&settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::transcode(
                    direction,
                    format!("failed to start {}: {}", settings.ffmpeg_path, e),
                )
            })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            return Err(RelayError::transcode(direction, "codec process pipes unavailable"));
        };

        let capacity = settings.channel_capacity.max(1);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let input_closed = Arc::new(AtomicBool::new(false));

        debug!(
            %direction,
            %format,
            pid = child.id().unwrap_or_default(),
            "Started ffmpeg pipeline"
        );

        let writer = tokio::spawn(feed_stdin(stdin, in_rx, input_closed.clone(), direction));
        let reader = tokio::spawn(drain_stdout(child, stdout, out_tx, input_closed, direction));
        let errors = tokio::spawn(log_stderr(stderr, direction));

        Ok((
            TranscodeInput { tx: in_tx, direction },
            TranscodeOutput {
                rx: out_rx,
                _tasks: TaskGuard(vec![writer, reader, errors]),
            },
        ))
    }
}

/// Build the ffmpeg command line for one pipeline.
///
/// ## Examples:
/// - Uplink WebM: `-f webm -c:a libopus -i pipe:0 -f s16le -ar 16000 -ac 1 pipe:1`
/// - Downlink Ogg: `-f s16le -ar 16000 -ac 1 -i pipe:0 -c:a libopus -b:a 24k -f ogg pipe:1`
pub fn ffmpeg_args(
    direction: Direction,
    format: AudioFormat,
    pcm: PcmSpec,
    settings: &TranscoderSettings,
) -> Vec<String> {
    let rate = pcm.sample_rate.to_string();
    let channels = pcm.channels.to_string();
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-fflags", "nobuffer"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    let raw = ["-f", "s16le", "-ar", rate.as_str(), "-ac", channels.as_str()];

    match direction {
        Direction::Uplink => {
            let input: &[&str] = match format {
                AudioFormat::WebmOpus => &["-f", "webm", "-c:a", "libopus"],
                AudioFormat::OggOpus => &["-f", "ogg", "-c:a", "libopus"],
                AudioFormat::Wav => &["-f", "wav"],
                AudioFormat::Pcm16 => &raw,
            };
            args.extend(input.iter().map(|s| s.to_string()));
            args.extend(["-i", "pipe:0"].iter().map(|s| s.to_string()));
            args.extend(raw.iter().map(|s| s.to_string()));
        }
        Direction::Downlink => {
            args.extend(raw.iter().map(|s| s.to_string()));
            args.extend(["-i", "pipe:0"].iter().map(|s| s.to_string()));
            let output: Vec<&str> = match format {
                AudioFormat::WebmOpus => {
                    vec!["-c:a", "libopus", "-b:a", settings.opus_bitrate.as_str(), "-f", "webm"]
                }
                AudioFormat::OggOpus => {
                    vec!["-c:a", "libopus", "-b:a", settings.opus_bitrate.as_str(), "-f", "ogg"]
                }
                AudioFormat::Wav => vec!["-f", "wav"],
                AudioFormat::Pcm16 => raw.to_vec(),
            };
            args.extend(output.iter().map(|s| s.to_string()));
            args.extend(["-flush_packets", "1"].iter().map(|s| s.to_string()));
        }
    }

    args.push("pipe:1".to_string());
    args
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<Vec<u8>>,
    input_closed: Arc<AtomicBool>,
    direction: Direction,
) {
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = stdin.write_all(&chunk).await {
            // The process is gone; the reader reports the failure
            warn!(%direction, error = %err, "Codec stdin closed while writing");
            return;
        }
    }

    input_closed.store(true, Ordering::Release);
    if let Err(err) = stdin.shutdown().await {
        debug!(%direction, error = %err, "Codec stdin shutdown failed");
    }
}

async fn drain_stdout(
    mut child: Child,
    mut stdout: ChildStdout,
    tx: mpsc::Sender<Result<Vec<u8>, RelayError>>,
    input_closed: Arc<AtomicBool>,
    direction: Direction,
) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    debug!(%direction, "Codec output dropped, stopping process");
                    let _ = child.kill().await;
                    return;
                }
            }
            Err(err) => {
                let _ = child.kill().await;
                let _ = tx
                    .send(Err(RelayError::transcode(direction, format!("stdout read failed: {}", err))))
                    .await;
                return;
            }
        }
    }

    let failure = match tokio::time::timeout(EXIT_WAIT, child.wait()).await {
        Ok(Ok(status)) if status.success() && input_closed.load(Ordering::Acquire) => None,
        Ok(Ok(status)) if status.success() => Some("codec process exited before its input closed".to_string()),
        Ok(Ok(status)) => Some(format!("codec process exited with {}", status)),
        Ok(Err(err)) => Some(format!("failed to reap codec process: {}", err)),
        Err(_) => {
            let _ = child.kill().await;
            Some("codec process did not exit after closing its output".to_string())
        }
    };

    match failure {
        Some(reason) => {
            warn!(%direction, %reason, "Codec pipeline failed");
            let _ = tx.send(Err(RelayError::transcode(direction, reason))).await;
        }
        None => debug!(%direction, "Codec pipeline finished"),
    }
}

async fn log_stderr(stderr: ChildStderr, direction: Direction) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(%direction, "ffmpeg: {}", line);
    }
}

//! # Connection Supervisor
//!
//! Owns the lifecycle of one session's link to the speech sidecar: connect
//! with a per-attempt timeout, retry with a fixed delay, and fall back to
//! degraded (text-only) mode instead of failing the session when the sidecar
//! cannot be reached.
//!
//! ## State Machine:
//! ```text
//! Disconnected -> Connecting -> Connected
//!                     |             |  (sidecar closed)
//!                     v             v
//!                  Degraded <- Connecting (reconnect)
//! any state -> Closed (close(), idempotent)
//! ```
//!
//! ## Connectors:
//! The transport is behind the `SidecarConnector` trait:
//! - **WebSocketConnector**: the real sidecar over tokio-tungstenite
//! - **LoopbackConnector**: an in-process echo sidecar with a processing
//!   delay, for local development without a GPU box

use crate::error::RelayError;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// Outbound half of a sidecar link: PCM chunks in.
pub type SidecarSender = Pin<Box<dyn Sink<Vec<u8>, Error = RelayError> + Send>>;

/// Inbound half of a sidecar link: PCM chunks out, ends when the sidecar closes.
pub type SidecarReceiver = Pin<Box<dyn Stream<Item = Result<Vec<u8>, RelayError>> + Send>>;

/// Upper bound on sending a close frame during shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Sidecar unreachable; the session keeps running without it
    Degraded,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open duplex link to the sidecar.
pub struct SidecarLink {
    pub sender: SidecarSender,
    pub receiver: SidecarReceiver,
}

/// Opens transport links to the sidecar.
///
/// ## Rust Concepts:
/// - **`impl Future` in a trait**: each connector returns its own future type,
///   so there is no boxing per attempt and no `async-trait` macro
/// - **`+ Send`**: the supervisor runs inside `tokio::spawn`, so the future
///   has to be movable across worker threads
pub trait SidecarConnector: Send + Sync + 'static {
    fn connect(&self, url: &str) -> impl Future<Output = Result<SidecarLink, RelayError>> + Send;
}

/// Connects to the sidecar over WebSocket; PCM travels as binary frames.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl SidecarConnector for WebSocketConnector {
    fn connect(&self, url: &str) -> impl Future<Output = Result<SidecarLink, RelayError>> + Send {
        let url = url.to_string();
        async move {
            let (socket, response) = tokio_tungstenite::connect_async(url.as_str()).await?;
            debug!(url = %url, status = %response.status(), "Sidecar WebSocket handshake complete");

            let (sink, stream) = socket.split();

            let sender = sink.with(|pcm: Vec<u8>| future::ready(Ok::<_, RelayError>(Message::Binary(pcm))));

            let receiver = stream.filter_map(|message| {
                future::ready(match message {
                    Ok(Message::Binary(pcm)) => Some(Ok(pcm)),
                    Ok(Message::Text(text)) => {
                        debug!(text = %text, "Ignoring text frame from sidecar");
                        None
                    }
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "Sidecar sent close frame");
                        None
                    }
                    Ok(_) => None,
                    Err(err) => Some(Err(RelayError::from(err))),
                })
            });

            Ok(SidecarLink {
                sender: Box::pin(sender),
                receiver: Box::pin(receiver),
            })
        }
    }
}

/// In-process echo sidecar: every chunk comes back after `delay`.
///
/// Chunks are delayed from their own arrival time, so a steady input stream
/// comes back as a steady output stream shifted by `delay`.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    delay: Duration,
    capacity: usize,
}

impl LoopbackConnector {
    pub fn new(delay: Duration, capacity: usize) -> Self {
        Self { delay, capacity: capacity.max(1) }
    }
}

impl SidecarConnector for LoopbackConnector {
    fn connect(&self, _url: &str) -> impl Future<Output = Result<SidecarLink, RelayError>> + Send {
        let delay = self.delay;
        let capacity = self.capacity;
        async move {
            let (in_tx, mut in_rx) = mpsc::channel::<(Instant, Vec<u8>)>(capacity);
            let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(capacity);

            tokio::spawn(async move {
                while let Some((arrived, pcm)) = in_rx.recv().await {
                    tokio::time::sleep_until(arrived + delay).await;
                    if out_tx.send(pcm).await.is_err() {
                        break;
                    }
                }
                debug!("Loopback sidecar finished");
            });

            let sender = futures_util::sink::unfold(in_tx, |tx, pcm: Vec<u8>| async move {
                tx.send((Instant::now(), pcm))
                    .await
                    .map_err(|_| RelayError::connection(1, "loopback sidecar stopped"))?;
                Ok::<_, RelayError>(tx)
            });

            Ok(SidecarLink {
                sender: Box::pin(sender),
                receiver: Box::pin(ReceiverStream::new(out_rx).map(Ok)),
            })
        }
    }
}

/// Retry policy and target address.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:9000/v1/audio-stream".to_string(),
            connect_timeout: Duration::from_secs(10),
            max_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

/// Result of a connect or reconnect.
pub enum ConnectOutcome {
    /// Link is up; sidecar audio arrives on the receiver
    Connected(SidecarReceiver),
    /// Every attempt failed; keep the session alive without the sidecar
    Degraded(RelayError),
}

impl fmt::Debug for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectOutcome::Connected(_) => f.write_str("Connected(..)"),
            ConnectOutcome::Degraded(err) => f.debug_tuple("Degraded").field(err).finish(),
        }
    }
}

/// What `send` did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// No live link; the chunk was dropped and counted
    Dropped,
}

/// Connection owner for a single session.
///
/// ## Ownership:
/// Exactly one task (the sidecar pump) owns the supervisor and drives every
/// transition. Other tasks observe the state through `subscribe()`.
pub struct ConnectionSupervisor<C: SidecarConnector> {
    connector: C,
    settings: SupervisorSettings,
    sender: Option<SidecarSender>,
    state: watch::Sender<ConnectionState>,
    dropped_chunks: u64,
}

impl<C: SidecarConnector> ConnectionSupervisor<C> {
    pub fn new(connector: C, settings: SupervisorSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            settings,
            sender: None,
            state,
            dropped_chunks: 0,
        }
    }

    /// Connect with retries.
    ///
    /// ## Timing:
    /// Each attempt is bounded by `connect_timeout`, and `reconnect_delay`
    /// separates attempts, so the worst case is
    /// `max_attempts * connect_timeout + (max_attempts - 1) * reconnect_delay`.
    pub async fn connect(&mut self) -> ConnectOutcome {
        if self.state() == ConnectionState::Closed {
            return ConnectOutcome::Degraded(RelayError::connection(0, "supervisor is closed"));
        }

        self.set_state(ConnectionState::Connecting);
        let max_attempts = self.settings.max_attempts.max(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            let pending = self.connector.connect(&self.settings.url);
            let result = tokio::time::timeout(self.settings.connect_timeout, pending).await;
            match result {
                Ok(Ok(link)) => {
                    info!(url = %self.settings.url, attempt, "Connected to sidecar");
                    self.sender = Some(link.sender);
                    self.set_state(ConnectionState::Connected);
                    return ConnectOutcome::Connected(link.receiver);
                }
                Ok(Err(err)) => {
                    last_reason = match err {
                        RelayError::Connection { reason, .. } => reason,
                        other => other.to_string(),
                    };
                }
                Err(_) => {
                    last_reason = format!("timed out after {}ms", self.settings.connect_timeout.as_millis());
                }
            }

            warn!(
                url = %self.settings.url,
                attempt,
                max_attempts,
                reason = %last_reason,
                "Sidecar connection attempt failed"
            );

            if attempt < max_attempts {
                tokio::time::sleep(self.settings.reconnect_delay).await;
            }
        }

        let err = RelayError::connection(max_attempts, last_reason);
        error!(url = %self.settings.url, error = %err, "Sidecar unavailable, entering degraded mode");
        self.set_state(ConnectionState::Degraded);
        ConnectOutcome::Degraded(err)
    }

    /// Drop the current link and run the connect policy again.
    pub async fn reconnect(&mut self) -> ConnectOutcome {
        if self.state() == ConnectionState::Closed {
            return ConnectOutcome::Degraded(RelayError::connection(0, "supervisor is closed"));
        }
        self.sender = None;
        self.set_state(ConnectionState::Disconnected);
        self.connect().await
    }

    /// Forward a PCM chunk to the sidecar.
    ///
    /// Without a live link the chunk is dropped and counted. A failed send
    /// marks the link lost and returns the error; the pump reconnects when
    /// the receiving half ends.
    pub async fn send(&mut self, pcm: Vec<u8>) -> Result<Delivery, RelayError> {
        let Some(sender) = self.sender.as_mut() else {
            self.dropped_chunks += 1;
            return Ok(Delivery::Dropped);
        };

        match sender.send(pcm).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(err) => {
                warn!(error = %err, "Sidecar send failed, link lost");
                self.sender = None;
                self.dropped_chunks += 1;
                self.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Close the link. Safe to call in any state, any number of times.
    pub async fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }

        if let Some(mut sender) = self.sender.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, sender.close()).await {
                Ok(Ok(())) => debug!("Sidecar link closed"),
                Ok(Err(err)) => debug!(error = %err, "Sidecar link close failed"),
                Err(_) => debug!("Sidecar link close timed out"),
            }
        }

        self.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Read-only view of state changes, for status reporting.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Chunks dropped because no link was available.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "Sidecar connection state changed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted connector for driving the supervisor and session without a network.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub enum Script {
        /// Refuse the attempt
        Refuse,
        /// Never answer; the supervisor's timeout has to fire
        Hang,
        /// Accept and hand the test both ends of the link
        Accept,
    }

    /// The sidecar side of an accepted link.
    pub struct FakeSidecar {
        /// PCM the relay sent
        pub received: mpsc::Receiver<Vec<u8>>,
        /// Drop to simulate the sidecar closing; send to simulate sidecar audio
        pub outbound: mpsc::Sender<Vec<u8>>,
    }

    #[derive(Clone, Default)]
    pub struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Script>>>,
        attempts: Arc<AtomicU32>,
        sidecars: Arc<Mutex<VecDeque<FakeSidecar>>>,
    }

    impl ScriptedConnector {
        /// Steps are consumed in order; once exhausted every attempt is refused.
        pub fn new(steps: impl IntoIterator<Item = Script>) -> Self {
            Self {
                script: Arc::new(Mutex::new(steps.into_iter().collect())),
                ..Self::default()
            }
        }

        pub fn attempts(&self) -> u32 {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Take the sidecar end of the oldest accepted link.
        pub fn take_sidecar(&self) -> Option<FakeSidecar> {
            self.sidecars.lock().unwrap().pop_front()
        }
    }

    impl SidecarConnector for ScriptedConnector {
        fn connect(&self, _url: &str) -> impl Future<Output = Result<SidecarLink, RelayError>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().unwrap().pop_front().unwrap_or(Script::Refuse);
            let sidecars = self.sidecars.clone();

            async move {
                match step {
                    Script::Refuse => Err(RelayError::connection(1, "connection refused")),
                    Script::Hang => future::pending().await,
                    Script::Accept => {
                        let (to_sidecar, received) = mpsc::channel::<Vec<u8>>(64);
                        let (outbound, from_sidecar) = mpsc::channel::<Vec<u8>>(64);
                        sidecars.lock().unwrap().push_back(FakeSidecar { received, outbound });

                        let sender = futures_util::sink::unfold(to_sidecar, |tx, pcm: Vec<u8>| async move {
                            tx.send(pcm)
                                .await
                                .map_err(|_| RelayError::connection(1, "fake sidecar gone"))?;
                            Ok::<_, RelayError>(tx)
                        });

                        Ok(SidecarLink {
                            sender: Box::pin(sender),
                            receiver: Box::pin(ReceiverStream::new(from_sidecar).map(Ok)),
                        })
                    }
                }
            }
        }
    }
}

//! # Audio Relay Session
//!
//! One call, end to end. The session owns a connection supervisor, a
//! transcoder per direction, a barge-in detector and a jitter buffer, and
//! runs four tasks that move audio between them:
//!
//! ```text
//! client ─▶ [uplink] ─▶ uplink transcoder ─▶ [sidecar pump] ─▶ sidecar
//! sidecar ─▶ [sidecar pump] ─▶ barge-in gate ─▶ jitter buffer
//! jitter buffer ─▶ [emit timer] ─▶ downlink transcoder ─▶ [client writer] ─▶ client
//! ```
//!
//! ## Failure Containment:
//! - **Sidecar unreachable**: status `degraded`, uplink audio is dropped, the
//!   call stays up
//! - **Transcoder dies**: only its direction stops; the call ends only when
//!   both directions are dead
//! - **Client gone** or `end_call`: every task is told to stop, joined with
//!   a grace period, and aborted after it
//!
//! ## Client I/O:
//! The session reads `ClientInbound` and writes `ClientOutbound` over plain
//! channels. The WebSocket actor bridges those to the socket, and tests
//! drive them directly.

use crate::audio::barge_in::BargeInDetector;
use crate::audio::codec::{
    AudioFormat, Direction, TranscodeInput, TranscodeOutput, Transcoder, TranscoderSettings,
};
use crate::audio::frame::{samples_to_bytes, AudioFrame, PcmAssembler, PcmSpec};
use crate::audio::jitter::{JitterBuffer, JitterSettings, PlaybackCommand, PullOutcome};
use crate::error::RelayError;
use crate::relay::events::{
    EventSink, FanoutSink, SessionContext, SessionEvent, SessionRecorder, SessionSummary,
};
use crate::relay::protocol::{ClientInbound, ClientMessage, ClientOutbound, ServerMessage};
use crate::relay::supervisor::{
    ConnectOutcome, ConnectionState, ConnectionSupervisor, SidecarConnector, SidecarReceiver,
    SupervisorSettings,
};
use futures_util::future::join_all;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

/// Everything a session needs to know, resolved from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub pcm: PcmSpec,
    pub client_format: AudioFormat,
    /// Samples per emitted block
    pub block_samples: usize,
    /// Emit timer period
    pub block_duration: Duration,
    pub jitter: JitterSettings,
    pub quiet_window: Duration,
    pub supervisor: SupervisorSettings,
    pub transcoder: TranscoderSettings,
    /// How long stopped tasks get to finish before they are aborted
    pub shutdown_grace: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            pcm: PcmSpec::default(),
            client_format: AudioFormat::Pcm16,
            block_samples: 320,
            block_duration: Duration::from_millis(20),
            jitter: JitterSettings::default(),
            quiet_window: crate::audio::barge_in::DEFAULT_QUIET_WINDOW,
            supervisor: SupervisorSettings::default(),
            transcoder: TranscoderSettings::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    ClientDisconnect,
    EndCall,
    /// Both audio directions are dead
    Fatal(RelayError),
}

/// State visible to every task of one session.
struct SessionShared {
    ctx: SessionContext,
    sink: FanoutSink,
    outbound: mpsc::Sender<ClientOutbound>,
    stop: mpsc::Sender<StopReason>,
    uplink_failed: AtomicBool,
    downlink_failed: AtomicBool,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        self.sink.record(&self.ctx, &event);
    }

    fn request_stop(&self, reason: StopReason) {
        // A full channel means a stop is already pending
        let _ = self.stop.try_send(reason);
    }

    /// Send a control message; a closed client channel stops the session.
    async fn notify(&self, message: ServerMessage) -> bool {
        if self.outbound.send(ClientOutbound::Message(message)).await.is_err() {
            self.request_stop(StopReason::ClientDisconnect);
            return false;
        }
        true
    }

    /// Record a dead direction; when both are dead, stop the session.
    async fn fail_direction(&self, err: RelayError) {
        let direction = match &err {
            RelayError::Transcode { direction, .. } => *direction,
            _ => return,
        };
        let (mine, other) = match direction {
            Direction::Uplink => (&self.uplink_failed, &self.downlink_failed),
            Direction::Downlink => (&self.downlink_failed, &self.uplink_failed),
        };
        // Both tasks on a pipeline see it die; only the first one reports
        if mine.swap(true, Ordering::AcqRel) {
            debug!(%direction, error = %err, "Audio direction already stopped");
            return;
        }
        warn!(%direction, error = %err, "Audio direction stopped");

        self.emit(SessionEvent::Error {
            kind: err.code().to_string(),
            message: err.to_string(),
        });

        if other.load(Ordering::Acquire) {
            self.request_stop(StopReason::Fatal(err));
        } else {
            self.notify(ServerMessage::status(
                "degraded",
                format!("{} audio unavailable: {}", direction, err),
            ))
            .await;
        }
    }
}

/// A single call between a client and the sidecar.
pub struct RelaySession<C: SidecarConnector> {
    ctx: SessionContext,
    settings: RelaySettings,
    supervisor: ConnectionSupervisor<C>,
    sink: Arc<dyn EventSink>,
    recorder: Arc<SessionRecorder>,
}

impl<C: SidecarConnector> RelaySession<C> {
    /// Build a session. Nothing runs until `run` is awaited.
    ///
    /// ## Parameters:
    /// - **ctx**: session identity, used in every log line and event
    /// - **settings**: audio, jitter, retry and transcoder settings
    /// - **connector**: transport used to reach the sidecar
    /// - **sink**: where session events go besides the built-in recorder
    pub fn new(ctx: SessionContext, settings: RelaySettings, connector: C, sink: Arc<dyn EventSink>) -> Self {
        let supervisor = ConnectionSupervisor::new(connector, settings.supervisor.clone());
        Self {
            ctx,
            settings,
            supervisor,
            sink,
            recorder: Arc::new(SessionRecorder::new()),
        }
    }

    /// Sidecar connection state for status reporting.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe()
    }

    /// Relay audio until the client leaves, hangs up, or both directions die.
    ///
    /// Always finishes with a `session_ended` message (when the client is
    /// still there) and returns the call summary.
    pub async fn run(
        self,
        inbound: mpsc::Receiver<ClientInbound>,
        outbound: mpsc::Sender<ClientOutbound>,
    ) -> SessionSummary {
        let span = info_span!(
            "relay_session",
            session_id = %self.ctx.session_id,
            tenant_id = %self.ctx.tenant_id
        );
        self.run_inner(inbound, outbound).instrument(span).await
    }

    async fn run_inner(
        self,
        inbound: mpsc::Receiver<ClientInbound>,
        outbound: mpsc::Sender<ClientOutbound>,
    ) -> SessionSummary {
        let RelaySession { ctx, settings, supervisor, sink, recorder } = self;
        let (stop_tx, mut stop_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let shared = Arc::new(SessionShared {
            ctx: ctx.clone(),
            sink: FanoutSink::new().with(recorder.clone()).with(sink),
            outbound: outbound.clone(),
            stop: stop_tx,
            uplink_failed: AtomicBool::new(false),
            downlink_failed: AtomicBool::new(false),
        });

        info!(
            format = %settings.client_format,
            quiet_window_ms = settings.quiet_window.as_millis() as u64,
            "Relay session starting"
        );

        let uplink = open_pipeline(&shared, Direction::Uplink, &settings).await;
        let downlink = open_pipeline(&shared, Direction::Downlink, &settings).await;

        let barge_in = Arc::new(BargeInDetector::new(settings.quiet_window));
        let jitter = Arc::new(Mutex::new(JitterBuffer::new(settings.jitter)));
        let (uplink_in, uplink_out) = split(uplink);
        let (downlink_in, downlink_out) = split(downlink);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // With both pipelines dead a fatal stop is already queued
        let both_failed =
            shared.uplink_failed.load(Ordering::Acquire) && shared.downlink_failed.load(Ordering::Acquire);
        if !both_failed {
            shared
                .notify(ServerMessage::Ready {
                    session_id: ctx.session_id.clone(),
                    message: "Audio bridge ready. Start speaking!".to_string(),
                })
                .await;

            tasks.push(tokio::spawn(
                uplink_loop(
                    shared.clone(),
                    inbound,
                    uplink_in,
                    barge_in.clone(),
                    jitter.clone(),
                    shutdown_rx.clone(),
                )
                .in_current_span(),
            ));
            tasks.push(tokio::spawn(
                sidecar_pump(
                    shared.clone(),
                    supervisor,
                    uplink_out,
                    barge_in.clone(),
                    jitter.clone(),
                    settings.pcm,
                    shutdown_rx.clone(),
                )
                .in_current_span(),
            ));
            tasks.push(tokio::spawn(
                emit_timer(
                    shared.clone(),
                    jitter.clone(),
                    downlink_in,
                    settings.block_samples,
                    settings.block_duration,
                    settings.pcm,
                    shutdown_rx.clone(),
                )
                .in_current_span(),
            ));
            if let Some(output) = downlink_out {
                tasks.push(tokio::spawn(
                    client_writer(shared.clone(), output, shutdown_rx.clone()).in_current_span(),
                ));
            }
        }

        let reason = stop_rx.recv().await.unwrap_or(StopReason::ClientDisconnect);
        info!(?reason, "Relay session stopping");

        let _ = shutdown_tx.send(true);
        join_with_grace(tasks, settings.shutdown_grace).await;

        let playback = jitter.lock().await.snapshot();
        debug!(
            barge_in_frames = barge_in.dropped_frames(),
            buffered_samples = playback.buffered_samples,
            underruns = playback.underruns,
            overflows = playback.overflows,
            oldest_frame_age_ms = playback.oldest_frame_age_ms,
            "Playback state at shutdown"
        );

        let grace = settings.shutdown_grace;
        if let StopReason::Fatal(err) = &reason {
            let message = ClientOutbound::Message(ServerMessage::from(err));
            let _ = tokio::time::timeout(grace, outbound.send(message)).await;
        }

        let summary = recorder.summary(&ctx);
        let message = ClientOutbound::Message(ServerMessage::SessionEnded { summary: summary.clone() });
        let _ = tokio::time::timeout(grace, outbound.send(message)).await;

        info!(
            duration_ms = summary.duration_ms,
            user_audio_ms = summary.user_audio_ms,
            agent_audio_ms = summary.agent_audio_ms,
            barge_in_frames = summary.barge_in_frames,
            "Relay session ended"
        );
        summary
    }
}

type Pipeline = Option<(TranscodeInput, TranscodeOutput)>;

async fn open_pipeline(shared: &SessionShared, direction: Direction, settings: &RelaySettings) -> Pipeline {
    match Transcoder::spawn(direction, settings.client_format, settings.pcm, &settings.transcoder) {
        Ok(pipeline) => Some(pipeline),
        Err(err) => {
            shared.fail_direction(err).await;
            None
        }
    }
}

fn split(pipeline: Pipeline) -> (Option<TranscodeInput>, Option<TranscodeOutput>) {
    match pipeline {
        Some((input, output)) => (Some(input), Some(output)),
        None => (None, None),
    }
}

/// Signal every task, wait up to `grace` for them, then abort the stragglers.
async fn join_with_grace(tasks: Vec<JoinHandle<()>>, grace: Duration) {
    let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

    if tokio::time::timeout(grace, join_all(tasks)).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "Session tasks did not stop in time, aborting");
        for handle in aborts {
            handle.abort();
        }
    }
}

/// Client -> uplink transcoder, plus control messages.
async fn uplink_loop(
    shared: Arc<SessionShared>,
    mut inbound: mpsc::Receiver<ClientInbound>,
    mut uplink: Option<TranscodeInput>,
    barge_in: Arc<BargeInDetector>,
    jitter: Arc<Mutex<JitterBuffer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = inbound.recv() => message,
        };

        match message {
            None => {
                debug!("Client inbound closed");
                shared.request_stop(StopReason::ClientDisconnect);
                break;
            }
            Some(ClientInbound::Audio(chunk)) => {
                barge_in.mark_client_activity();
                let Some(input) = uplink.as_ref() else {
                    continue;
                };
                if let Err(err) = input.push(chunk).await {
                    uplink = None;
                    shared.fail_direction(err).await;
                }
            }
            Some(ClientInbound::Text(text)) => match ClientMessage::parse(&text) {
                Ok(ClientMessage::EndCall) => {
                    info!("Client ended the call");
                    shared.request_stop(StopReason::EndCall);
                    break;
                }
                Ok(ClientMessage::ResetPlayback) => {
                    jitter.lock().await.apply(PlaybackCommand::Reset);
                    debug!("Playback reset by client");
                }
                Ok(ClientMessage::Ping { timestamp }) => {
                    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                    shared.notify(ServerMessage::Pong { timestamp }).await;
                }
                Ok(ClientMessage::Pong { .. }) => {}
                Err(err) => {
                    warn!(error = %err, "Dropping malformed client message");
                    shared.emit(SessionEvent::Error {
                        kind: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
            },
        }
    }
}

async fn next_transcoded(output: &mut Option<TranscodeOutput>) -> Option<Result<Vec<u8>, RelayError>> {
    match output {
        Some(output) => output.next().await,
        None => std::future::pending().await,
    }
}

async fn next_sidecar(receiver: &mut Option<SidecarReceiver>) -> Option<Result<Vec<u8>, RelayError>> {
    match receiver {
        Some(receiver) => receiver.next().await,
        None => std::future::pending().await,
    }
}

/// Run a connect or reconnect unless the session is stopping first.
async fn connect_or_stop<F>(attempt: F, shutdown: &mut watch::Receiver<bool>) -> Option<ConnectOutcome>
where
    F: std::future::Future<Output = ConnectOutcome>,
{
    tokio::select! {
        biased;
        _ = shutdown.changed() => None,
        outcome = attempt => Some(outcome),
    }
}

/// Report a connect outcome and return the receiver if the link is up.
async fn settle_connection(
    shared: &SessionShared,
    outcome: ConnectOutcome,
    restored: bool,
) -> Option<SidecarReceiver> {
    match outcome {
        ConnectOutcome::Connected(receiver) => {
            if restored {
                shared.emit(SessionEvent::ConnectionRestored);
            }
            let message = if restored { "Voice model reconnected" } else { "Voice model connected" };
            shared.notify(ServerMessage::status("connected", message)).await;
            Some(receiver)
        }
        ConnectOutcome::Degraded(err) => {
            shared.emit(SessionEvent::ConnectionDegraded { reason: err.to_string() });
            shared
                .notify(ServerMessage::status(
                    "degraded",
                    "Voice model unavailable, continuing in text-only mode",
                ))
                .await;
            None
        }
    }
}

/// Owns the supervisor: uplink PCM to the sidecar, sidecar PCM to the jitter buffer.
async fn sidecar_pump<C: SidecarConnector>(
    shared: Arc<SessionShared>,
    mut supervisor: ConnectionSupervisor<C>,
    mut uplink: Option<TranscodeOutput>,
    barge_in: Arc<BargeInDetector>,
    jitter: Arc<Mutex<JitterBuffer>>,
    pcm: PcmSpec,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut assembler = PcmAssembler::new();
    let mut receiver = match connect_or_stop(supervisor.connect(), &mut shutdown).await {
        Some(outcome) => settle_connection(&shared, outcome, false).await,
        None => {
            supervisor.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,

            chunk = next_transcoded(&mut uplink) => match chunk {
                Some(Ok(bytes)) => {
                    shared.emit(SessionEvent::UserAudioReceived {
                        duration_ms: pcm.bytes_duration_ms(bytes.len()),
                        bytes: bytes.len(),
                    });
                    if let Err(err) = supervisor.send(bytes).await {
                        debug!(error = %err, "Uplink chunk lost with the sidecar link");
                    }
                }
                Some(Err(err)) => {
                    uplink = None;
                    shared.fail_direction(err).await;
                }
                None => uplink = None,
            },

            frame = next_sidecar(&mut receiver) => match frame {
                Some(Ok(bytes)) => {
                    let samples = assembler.push(&bytes);
                    if samples.is_empty() {
                        continue;
                    }
                    if barge_in.is_client_speaking() {
                        let dropped = barge_in.record_drop();
                        debug!(
                            dropped_frames = dropped,
                            quiet_window_ms = barge_in.quiet_window().as_millis() as u64,
                            "Client speaking, dropping agent audio"
                        );
                        shared.emit(SessionEvent::BargeIn { dropped_samples: samples.len() });
                        continue;
                    }
                    let outcome = jitter.lock().await.apply(PlaybackCommand::Push(AudioFrame::new(samples)));
                    if outcome.trimmed > 0 {
                        shared.emit(SessionEvent::BufferOverflow { trimmed_samples: outcome.trimmed });
                    }
                }
                other => {
                    if let Some(Err(err)) = &other {
                        warn!(error = %err, "Sidecar link failed");
                    } else {
                        warn!("Sidecar closed the connection");
                    }
                    receiver = None;
                    if assembler.has_pending() {
                        debug!("Discarding a partial sample from the closed link");
                    }
                    assembler.clear();

                    let Some(outcome) = connect_or_stop(supervisor.reconnect(), &mut shutdown).await else {
                        break;
                    };
                    if matches!(outcome, ConnectOutcome::Connected(_)) {
                        // Audio buffered from the old link belongs to a stream that no longer exists
                        jitter.lock().await.reset();
                    }
                    receiver = settle_connection(&shared, outcome, true).await;
                }
            },
        }
    }

    if supervisor.dropped_chunks() > 0 {
        info!(dropped_chunks = supervisor.dropped_chunks(), "Uplink audio dropped while the sidecar was unavailable");
    }
    supervisor.close().await;
}

/// Fixed-rate clock: one block per tick, silence included.
async fn emit_timer(
    shared: Arc<SessionShared>,
    jitter: Arc<Mutex<JitterBuffer>>,
    mut downlink: Option<TranscodeInput>,
    block_samples: usize,
    block_duration: Duration,
    pcm: PcmSpec,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(block_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let (block, outcome) = jitter.lock().await.pull(block_samples);

        let audible = match outcome {
            PullOutcome::Audio => block_samples,
            PullOutcome::Underrun { filled } => {
                shared.emit(SessionEvent::BufferUnderrun);
                filled
            }
            PullOutcome::Buffering | PullOutcome::Countdown => 0,
        };

        let Some(input) = downlink.as_ref() else {
            continue;
        };

        let bytes = samples_to_bytes(&block);
        if audible > 0 {
            shared.emit(SessionEvent::AgentAudioSent {
                duration_ms: pcm.duration_ms(audible),
                bytes: audible * 2,
            });
        }

        if let Err(err) = input.push(bytes).await {
            downlink = None;
            shared.fail_direction(err).await;
        }
    }
}

/// Downlink transcoder -> client.
async fn client_writer(shared: Arc<SessionShared>, mut output: TranscodeOutput, mut shutdown: watch::Receiver<bool>) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            chunk = output.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                let sent = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    sent = shared.outbound.send(ClientOutbound::Audio(bytes)) => sent,
                };
                if sent.is_err() {
                    debug!("Client outbound closed");
                    shared.request_stop(StopReason::ClientDisconnect);
                    break;
                }
            }
            Some(Err(err)) => {
                shared.fail_direction(err).await;
                break;
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::bytes_to_samples;
    use crate::relay::events::TracingSink;
    use crate::relay::supervisor::testing::{Script, ScriptedConnector};

    fn settings() -> RelaySettings {
        RelaySettings {
            quiet_window: Duration::from_millis(500),
            supervisor: SupervisorSettings {
                url: "ws://sidecar.test".to_string(),
                connect_timeout: Duration::from_millis(500),
                max_attempts: 2,
                reconnect_delay: Duration::from_millis(100),
            },
            ..RelaySettings::default()
        }
    }

    struct Harness {
        inbound: mpsc::Sender<ClientInbound>,
        outbound: mpsc::Receiver<ClientOutbound>,
        run: JoinHandle<SessionSummary>,
    }

    fn start(connector: ScriptedConnector, settings: RelaySettings) -> Harness {
        let ctx = SessionContext::new("session-test", "acme", None, settings.client_format);
        let session = RelaySession::new(ctx, settings, connector, Arc::new(TracingSink));
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        Harness {
            inbound: in_tx,
            outbound: out_rx,
            run: tokio::spawn(session.run(in_rx, out_tx)),
        }
    }

    /// Read outbound until a control message matches, skipping audio.
    async fn expect_message(
        outbound: &mut mpsc::Receiver<ClientOutbound>,
        matches: impl Fn(&ServerMessage) -> bool,
    ) -> ServerMessage {
        loop {
            match outbound.recv().await {
                Some(ClientOutbound::Message(message)) if matches(&message) => return message,
                Some(_) => continue,
                None => panic!("outbound closed before expected message"),
            }
        }
    }

    fn is_status(state: &'static str) -> impl Fn(&ServerMessage) -> bool {
        move |m| matches!(m, ServerMessage::Status { state: s, .. } if s == state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_uplink_reaches_sidecar_in_order() {
        let connector = ScriptedConnector::new([Script::Accept]);
        let mut h = start(connector.clone(), settings());
        expect_message(&mut h.outbound, is_status("connected")).await;
        let mut sidecar = connector.take_sidecar().unwrap();

        for i in 0..20u8 {
            h.inbound.send(ClientInbound::Audio(vec![i; 64])).await.unwrap();
        }
        for i in 0..20u8 {
            assert_eq!(sidecar.received.recv().await, Some(vec![i; 64]));
        }

        h.inbound.send(ClientInbound::Text(r#"{"type":"end_call"}"#.to_string())).await.unwrap();
        let summary = h.run.await.unwrap();
        assert_eq!(summary.user_audio_bytes, 20 * 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sidecar_audio_is_played_to_client() {
        let connector = ScriptedConnector::new([Script::Accept]);
        let mut h = start(connector.clone(), settings());
        expect_message(&mut h.outbound, is_status("connected")).await;
        let sidecar = connector.take_sidecar().unwrap();

        let agent: Vec<i16> = vec![4000; 1600];
        sidecar.outbound.send(samples_to_bytes(&agent)).await.unwrap();

        let mut heard = false;
        for _ in 0..50 {
            if let Some(ClientOutbound::Audio(bytes)) = h.outbound.recv().await {
                assert_eq!(bytes.len(), 640);
                if bytes_to_samples(&bytes).iter().any(|&s| s != 0) {
                    heard = true;
                    break;
                }
            }
        }
        assert!(heard, "agent audio never reached the client");

        drop(h.inbound);
        let summary = h.run.await.unwrap();
        assert!(summary.agent_audio_ms > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_drops_sidecar_audio() {
        let connector = ScriptedConnector::new([Script::Accept]);
        let mut h = start(connector.clone(), settings());
        expect_message(&mut h.outbound, is_status("connected")).await;
        let mut sidecar = connector.take_sidecar().unwrap();

        // The sidecar sees the chunk only after the detector was marked
        h.inbound.send(ClientInbound::Audio(vec![1; 32])).await.unwrap();
        sidecar.received.recv().await.unwrap();

        sidecar.outbound.send(samples_to_bytes(&vec![4000i16; 1600])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.inbound.send(ClientInbound::Text(r#"{"type":"end_call"}"#.to_string())).await.unwrap();
        let summary = h.run.await.unwrap();
        assert_eq!(summary.barge_in_frames, 1);
        assert_eq!(summary.dropped_samples, 1600);
        assert_eq!(summary.agent_audio_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_sidecar_degrades_without_closing() {
        let connector = ScriptedConnector::new([Script::Refuse, Script::Hang]);
        let mut h = start(connector.clone(), settings());

        expect_message(&mut h.outbound, is_status("degraded")).await;
        assert_eq!(connector.attempts(), 2);

        // Still serving the client
        h.inbound.send(ClientInbound::Audio(vec![0; 64])).await.unwrap();
        h.inbound.send(ClientInbound::Text(r#"{"type":"ping","timestamp":7}"#.to_string())).await.unwrap();
        let pong = expect_message(&mut h.outbound, |m| matches!(m, ServerMessage::Pong { .. })).await;
        assert_eq!(pong, ServerMessage::Pong { timestamp: 7 });

        drop(h.inbound);
        let summary = h.run.await.unwrap();
        assert_eq!(summary.degraded_events, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sidecar_close_reconnects() {
        let connector = ScriptedConnector::new([Script::Accept, Script::Accept]);
        let mut h = start(connector.clone(), settings());
        expect_message(&mut h.outbound, is_status("connected")).await;

        drop(connector.take_sidecar());
        expect_message(&mut h.outbound, is_status("connected")).await;
        assert_eq!(connector.attempts(), 2);

        drop(h.inbound);
        let summary = h.run.await.unwrap();
        assert_eq!(summary.restored_events, 1);
        assert_eq!(summary.degraded_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_control_message_is_dropped() {
        let connector = ScriptedConnector::new([Script::Accept]);
        let mut h = start(connector, settings());
        expect_message(&mut h.outbound, is_status("connected")).await;

        h.inbound.send(ClientInbound::Text("{not json".to_string())).await.unwrap();
        h.inbound.send(ClientInbound::Text(r#"{"type":"ping","timestamp":1}"#.to_string())).await.unwrap();
        expect_message(&mut h.outbound, |m| matches!(m, ServerMessage::Pong { .. })).await;

        drop(h.inbound);
        let summary = h.run.await.unwrap();
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_pipelines_close_with_structured_error() {
        let mut settings = settings();
        settings.client_format = AudioFormat::WebmOpus;
        settings.transcoder.ffmpeg_path = "/nonexistent/ffmpeg".to_string();

        let mut h = start(ScriptedConnector::new([Script::Accept]), settings);

        let error = expect_message(&mut h.outbound, |m| matches!(m, ServerMessage::Error { .. })).await;
        assert!(matches!(error, ServerMessage::Error { ref code, .. } if code == "transcode_failure"));
        expect_message(&mut h.outbound, |m| matches!(m, ServerMessage::SessionEnded { .. })).await;

        let summary = h.run.await.unwrap();
        assert_eq!(summary.transcode_failures, 2);
    }

    /// Installs an executable stand-in for ffmpeg that only runs the uplink.
    fn uplink_only_ffmpeg() -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!("voice-relay-ffmpeg-{}", uuid::Uuid::new_v4()));
        let script = "#!/bin/sh\ncase \"$*\" in\n  *\"-c:a libopus -i pipe:0\"*) exec cat ;;\n  *) exit 1 ;;\nesac\n";
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_dead_downlink_is_reported_once() {
        let mut settings = settings();
        settings.client_format = AudioFormat::WebmOpus;
        settings.transcoder.ffmpeg_path = uplink_only_ffmpeg();

        let mut h = start(ScriptedConnector::new([Script::Accept]), settings.clone());
        let mut degraded = 0;

        expect_message(&mut h.outbound, is_status("degraded")).await;
        degraded += 1;

        // The emit timer keeps pushing into the dead encoder meanwhile
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.inbound.send(ClientInbound::Text(r#"{"type":"end_call"}"#.to_string())).await.unwrap();

        loop {
            match h.outbound.recv().await {
                Some(ClientOutbound::Message(ServerMessage::SessionEnded { .. })) | None => break,
                Some(ClientOutbound::Message(m)) if is_status("degraded")(&m) => degraded += 1,
                Some(_) => {}
            }
        }

        let summary = h.run.await.unwrap();
        let _ = std::fs::remove_file(&settings.transcoder.ffmpeg_path);
        assert_eq!(degraded, 1);
        assert_eq!(summary.transcode_failures, 1);
        assert_eq!(summary.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_outbound_closed_ends_session() {
        let connector = ScriptedConnector::new([Script::Accept]);
        let h = start(connector, settings());
        drop(h.outbound);

        let summary = tokio::time::timeout(Duration::from_secs(5), h.run).await.unwrap().unwrap();
        assert_eq!(summary.session_id, "session-test");
    }
}

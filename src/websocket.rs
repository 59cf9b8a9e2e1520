//! # Call WebSocket Handler
//!
//! One WebSocket per phone call. Clients connect to `/ws/call/{tenant_id}`
//! and stream audio in their own container format; the relay forwards it to
//! the speech sidecar and plays the agent's audio back over the same socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: `GET /ws/call/{tenant_id}?format=webm_opus&customer_phone=...`
//! 2. **Admission**: the server answers `connected`, or `error{code: "capacity"}`
//!    followed by a close frame when the session limit is reached
//! 3. **Ready**: `ready` once the transcoders and sidecar link are set up
//! 4. **Streaming**: binary frames both ways, client-format audio
//! 5. **Control**: JSON `ping`, `pong`, `reset_playback`, `end_call`
//! 6. **End**: `session_ended{summary}`, then a close frame
//!
//! ## Actor Model:
//! The actor only moves frames. The call itself runs as a `RelaySession`
//! on its own task and talks to the actor through two bounded channels:
//! binary and text frames go in through `ClientInbound`, and a forwarder
//! task turns every `ClientOutbound` into an actor message.

use crate::audio::codec::AudioFormat;
use crate::config::{AppConfig, SidecarMode};
use crate::error::AppError;
use crate::relay::events::{SessionContext, TracingSink};
use crate::relay::protocol::{ClientInbound, ClientOutbound, ServerMessage};
use crate::relay::session::RelaySession;
use crate::relay::supervisor::{LoopbackConnector, SidecarConnector, WebSocketConnector};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Query parameters of the call endpoint.
#[derive(Debug, Deserialize)]
pub struct CallQuery {
    /// Client container format; the configured default when absent
    pub format: Option<String>,
    pub customer_phone: Option<String>,
}

/// WebSocket actor for one call.
pub struct CallWebSocket {
    call: SessionContext,
    config: AppConfig,
    state: web::Data<AppState>,

    /// Sender half of the session's inbound channel; `None` until started
    inbound: Option<mpsc::Sender<ClientInbound>>,

    /// Last time anything arrived from the client
    last_heartbeat: Instant,
}

/// A frame the session wants written to the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outgoing(ClientOutbound);

/// The session is over; close the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct CloseCall;

impl CallWebSocket {
    pub fn new(call: SessionContext, config: AppConfig, state: web::Data<AppState>) -> Self {
        Self {
            call,
            config,
            state,
            inbound: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.call.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping = ServerMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis(),
            };
            ctx.text(ping.to_json());
        });
    }

    /// Hand a client frame to the session.
    ///
    /// A full channel pauses the actor until the session catches up, so
    /// frames are never reordered or silently dropped.
    fn forward_inbound(&mut self, item: ClientInbound, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = &self.inbound else {
            return;
        };

        match inbound.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                debug!(session_id = %self.call.session_id, "Inbound channel full, pausing client reads");
                let inbound = inbound.clone();
                ctx.wait(
                    async move {
                        let _ = inbound.send(item).await;
                    }
                    .into_actor(self),
                );
            }
            Err(TrySendError::Closed(_)) => {
                // Session already finished; the close frame is on its way
                self.inbound = None;
            }
        }
    }
}

impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            session_id = %self.call.session_id,
            tenant_id = %self.call.tenant_id,
            format = %self.call.client_format,
            "Call WebSocket connected"
        );

        self.start_heartbeat(ctx);

        let capacity = self.config.performance.channel_capacity;
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        self.inbound = Some(inbound_tx);

        let addr = ctx.address();
        tokio::spawn(forward_outbound(outbound_rx, addr.clone().recipient(), addr.recipient()));
        tokio::spawn(start_call(
            self.call.clone(),
            self.config.clone(),
            self.state.clone(),
            inbound_rx,
            outbound_tx,
        ));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Dropping the sender tells the session the client is gone
        self.inbound = None;
        info!(session_id = %self.call.session_id, "Call WebSocket stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.forward_inbound(ClientInbound::Audio(data.to_vec()), ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward_inbound(ClientInbound::Text(text.to_string()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.call.session_id, ?reason, "Client closed the call");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.call.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.call.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outgoing> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outgoing, ctx: &mut Self::Context) {
        match msg.0 {
            ClientOutbound::Audio(bytes) => ctx.binary(bytes),
            ClientOutbound::Message(message) => ctx.text(message.to_json()),
        }
    }
}

impl Handler<CloseCall> for CallWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: CloseCall, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

/// Deliver session output to the actor in order, then close the socket
/// once the session has dropped its sender.
///
/// Each frame is awaited until the actor has handled it, so a slow socket
/// holds the outbound channel full instead of growing the actor mailbox.
async fn forward_outbound(
    mut outbound: mpsc::Receiver<ClientOutbound>,
    frames: Recipient<Outgoing>,
    close: Recipient<CloseCall>,
) {
    while let Some(item) = outbound.recv().await {
        if frames.send(Outgoing(item)).await.is_err() {
            debug!("Client socket gone, dropping session output");
            return;
        }
    }
    let _ = close.send(CloseCall).await;
}

/// Pick the sidecar transport and run the call.
async fn start_call(
    call: SessionContext,
    config: AppConfig,
    state: web::Data<AppState>,
    inbound: mpsc::Receiver<ClientInbound>,
    outbound: mpsc::Sender<ClientOutbound>,
) {
    match config.sidecar.mode {
        SidecarMode::Websocket => {
            run_call(call, &config, &state, WebSocketConnector, inbound, outbound).await
        }
        SidecarMode::Loopback => {
            let connector = LoopbackConnector::new(
                Duration::from_millis(config.sidecar.loopback_delay_ms),
                config.performance.channel_capacity,
            );
            run_call(call, &config, &state, connector, inbound, outbound).await
        }
    }
}

/// Admit, run and account for one call.
///
/// ## Flow:
/// 1. Claim a registry slot; refuse with `error{code: "capacity"}` when full
/// 2. Send `connected` and run the session to completion
/// 3. Fold the summary into the relay metrics and release the slot
///
/// Dropping `outbound` on return is what closes the client socket.
async fn run_call<C: SidecarConnector>(
    call: SessionContext,
    config: &AppConfig,
    state: &AppState,
    connector: C,
    inbound: mpsc::Receiver<ClientInbound>,
    outbound: mpsc::Sender<ClientOutbound>,
) {
    let settings = config.relay_settings(call.client_format);
    let session = RelaySession::new(call.clone(), settings, connector, Arc::new(TracingSink));

    if let Err(err) = state.registry.register(&call, session.connection_state()).await {
        state.metrics.session_rejected();
        let code = match err {
            AppError::Unavailable(_) => "capacity",
            _ => "session_error",
        };
        warn!(session_id = %call.session_id, code, "Call refused: {}", err);
        let _ = outbound
            .send(ClientOutbound::Message(ServerMessage::error(code, err.to_string())))
            .await;
        return;
    }
    state.metrics.session_started();

    let connected = ServerMessage::Connected {
        session_id: call.session_id.clone(),
        tenant_id: call.tenant_id.clone(),
        message: "Connected to voice relay".to_string(),
    };
    if outbound.send(ClientOutbound::Message(connected)).await.is_err() {
        debug!(session_id = %call.session_id, "Client left before the session started");
    }

    let summary = session.run(inbound, outbound).await;

    state.metrics.record_summary(&summary);
    state.registry.remove(&call.session_id).await;
    info!(
        session_id = %call.session_id,
        duration_ms = summary.duration_ms,
        user_audio_ms = summary.user_audio_ms,
        agent_audio_ms = summary.agent_audio_ms,
        barge_in_frames = summary.barge_in_frames,
        "Call finished"
    );
}

/// `GET /ws/call/{tenant_id}`: upgrade to a call WebSocket.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    query: web::Query<CallQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let tenant_id = path.into_inner();
    if tenant_id.trim().is_empty() {
        return Err(AppError::BadRequest("tenant_id must not be empty".to_string()).into());
    }

    let config = app_state.get_config();
    let query = query.into_inner();
    let client_format = match query.format.as_deref() {
        Some(format) => format.parse::<AudioFormat>().map_err(AppError::BadRequest)?,
        None => config.audio.client_format,
    };

    let call = SessionContext::new(
        uuid::Uuid::new_v4().to_string(),
        tenant_id,
        query.customer_phone,
        client_format,
    );

    info!(
        session_id = %call.session_id,
        tenant_id = %call.tenant_id,
        peer = ?req.connection_info().peer_addr(),
        "New call WebSocket request"
    );

    ws::start(CallWebSocket::new(call, config, app_state), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::supervisor::testing::{Script, ScriptedConnector};
    use actix_web::{test, App};

    fn call(session_id: &str) -> SessionContext {
        SessionContext::new(session_id, "tenant-a", None, AudioFormat::Pcm16)
    }

    async fn drain(mut outbound: mpsc::Receiver<ClientOutbound>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Some(item) = outbound.recv().await {
            if let ClientOutbound::Message(message) = item {
                messages.push(message);
            }
        }
        messages
    }

    /// Stands in for the socket actor and records what it is handed.
    #[derive(Default)]
    struct RecordingSocket {
        frames: Arc<std::sync::Mutex<Vec<ClientOutbound>>>,
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    impl Actor for RecordingSocket {
        type Context = Context<Self>;
    }

    impl Handler<Outgoing> for RecordingSocket {
        type Result = ();

        fn handle(&mut self, msg: Outgoing, _ctx: &mut Self::Context) {
            self.frames.lock().unwrap().push(msg.0);
        }
    }

    impl Handler<CloseCall> for RecordingSocket {
        type Result = ();

        fn handle(&mut self, _msg: CloseCall, ctx: &mut Self::Context) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            ctx.stop();
        }
    }

    #[actix_web::test]
    async fn test_forwarder_delivers_in_order_then_closes() {
        let socket = RecordingSocket::default();
        let frames = socket.frames.clone();
        let closed = socket.closed.clone();
        let addr = socket.start();

        let (tx, rx) = mpsc::channel(2);
        let forwarder = tokio::spawn(forward_outbound(rx, addr.clone().recipient(), addr.recipient()));

        for i in 0..10u8 {
            tx.send(ClientOutbound::Audio(vec![i; 4])).await.unwrap();
        }
        drop(tx);
        forwarder.await.unwrap();

        let expected: Vec<ClientOutbound> = (0..10u8).map(|i| ClientOutbound::Audio(vec![i; 4])).collect();
        assert_eq!(*frames.lock().unwrap(), expected);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[actix_web::test]
    async fn test_forwarder_stops_when_socket_is_gone() {
        let socket = RecordingSocket::default();
        let frames = socket.frames.clone();
        let addr = socket.start();

        // Stop the socket first
        let (tx, rx) = mpsc::channel(2);
        drop(tx);
        forward_outbound(rx, addr.clone().recipient(), addr.clone().recipient()).await;

        let (tx, rx) = mpsc::channel(2);
        let forwarder = tokio::spawn(forward_outbound(rx, addr.clone().recipient(), addr.recipient()));
        let _ = tx.send(ClientOutbound::Audio(vec![1; 4])).await;

        tokio::time::timeout(Duration::from_secs(5), forwarder).await.unwrap().unwrap();
        assert!(tx.is_closed());
        assert!(frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_over_capacity_is_refused() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let state = AppState::new(config.clone());

        let (_, watch_rx) = tokio::sync::watch::channel(crate::relay::supervisor::ConnectionState::Connected);
        state.registry.register(&call("existing"), watch_rx).await.unwrap();

        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let connector = ScriptedConnector::new([Script::Accept]);

        run_call(call("second"), &config, &state, connector.clone(), inbound_rx, outbound_tx).await;

        let messages = drain(outbound_rx).await;
        assert_eq!(messages.len(), 1);
        assert!(matches!(&messages[0], ServerMessage::Error { code, .. } if code == "capacity"));
        assert_eq!(state.metrics.snapshot().sessions_rejected, 1);
        assert_eq!(state.registry.active_count().await, 1);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_finished_call_is_accounted_and_released() {
        let config = AppConfig::default();
        let state = AppState::new(config.clone());

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let connector = ScriptedConnector::new([Script::Accept]);

        let run = tokio::spawn({
            let state = state.clone();
            async move {
                run_call(call("call-1"), &config, &state, connector, inbound_rx, outbound_tx).await;
            }
        });

        inbound_tx
            .send(ClientInbound::Text(r#"{"type":"end_call"}"#.to_string()))
            .await
            .unwrap();

        let messages = drain(outbound_rx).await;
        run.await.unwrap();

        assert!(matches!(messages.first(), Some(ServerMessage::Connected { session_id, .. }) if session_id == "call-1"));
        assert!(matches!(messages.last(), Some(ServerMessage::SessionEnded { .. })));

        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.sessions_started, 1);
        assert_eq!(metrics.sessions_completed, 1);
        assert_eq!(state.registry.active_count().await, 0);
    }

    #[actix_web::test]
    async fn test_unknown_format_is_rejected_before_upgrade() {
        let state = web::Data::new(AppState::new(AppConfig::default()));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/ws/call/{tenant_id}", web::get().to(call_websocket)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/ws/call/tenant-a?format=mp3")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), actix_web::http::StatusCode::BAD_REQUEST);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["error"]["type"], "bad_request");
        assert!(body["error"]["message"].as_str().unwrap().contains("mp3"));
    }
}

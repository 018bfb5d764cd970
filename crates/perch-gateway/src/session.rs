//! Gateway session
//!
//! One persistent duplex connection with a state machine around it:
//! handshake, heartbeat liveness, sequence tracking, and the
//! resume-vs-fresh-identify decision on every disconnect.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use perch_core::dispatch::{EntityCache, EventSink, NoopCache};
use perch_core::observer::{DebugEvent, DebugSink, TracingSink};
use perch_core::TokenProvider;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{Interval, Sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{GatewayOptions, IdentifyOverlay};
use crate::error::{GatewayError, Result};
use crate::protocol::{Hello, Identify, InboundFrame, Opcode, OutboundFrame, PresenceUpdate, Resume};
use crate::quota::SendQuota;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Where the connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Connected,
    Resuming,
}

/// Mutable session state shared between the reader loop, the heartbeat
/// timer and external observers.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub heartbeat_interval: Option<Duration>,
    pub last_heartbeat_sent: Option<DateTime<Utc>>,
    pub last_heartbeat_ack: Option<DateTime<Utc>>,
    pub sequence: Option<u64>,
    pub session_id: Option<String>,
}

impl SessionState {
    /// Clear everything a fresh handshake must not inherit.
    fn reset(&mut self) {
        self.heartbeat_interval = None;
        self.last_heartbeat_sent = None;
        self.last_heartbeat_ack = None;
        self.sequence = None;
        self.session_id = None;
    }

    /// Both fields the resume path requires are present.
    fn resumable(&self) -> bool {
        self.session_id.is_some() && self.sequence.is_some()
    }
}

/// How a connection ended.
enum Outcome {
    /// Caller-initiated; never resume.
    Shutdown,
    /// Close or transport error; reconnect (resuming when possible).
    Reconnect,
}

/// A persistent gateway session.
///
/// `connect` runs the connection loop until `shutdown`; `send` is safe to
/// call concurrently from other tasks and queues while disconnected or
/// while the outbound window is exhausted.
pub struct GatewaySession {
    options: GatewayOptions,
    token: Arc<TokenProvider>,
    events: Arc<dyn EventSink>,
    cache: Arc<dyn EntityCache>,
    sink: Arc<dyn DebugSink>,
    state: Arc<RwLock<SessionState>>,
    quota: SendQuota,
    overlay: RwLock<IdentifyOverlay>,
    outbound_tx: mpsc::UnboundedSender<OutboundFrame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundFrame>>>,
    cancel: CancellationToken,
}

impl GatewaySession {
    /// Create a session with the default cache (none) and debug sink.
    pub fn new(
        options: GatewayOptions,
        token: Arc<TokenProvider>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_collaborators(options, token, events, Arc::new(NoopCache), Arc::new(TracingSink))
    }

    /// Create a session with explicit cache and debug sink collaborators.
    pub fn with_collaborators(
        options: GatewayOptions,
        token: Arc<TokenProvider>,
        events: Arc<dyn EventSink>,
        cache: Arc<dyn EntityCache>,
        sink: Arc<dyn DebugSink>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let quota = SendQuota::new(options.send_limit, options.send_window);
        Self {
            options,
            token,
            events,
            cache,
            sink,
            state: Arc::new(RwLock::new(SessionState::default())),
            quota,
            overlay: RwLock::new(IdentifyOverlay::default()),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Snapshot of the session state.
    pub async fn state(&self) -> SessionState {
        self.state.read().await.clone()
    }

    /// Heartbeat round-trip time, once at least one ack arrived.
    pub async fn ping(&self) -> Option<Duration> {
        let state = self.state.read().await;
        let sent = state.last_heartbeat_sent?;
        let ack = state.last_heartbeat_ack?;
        (ack - sent).to_std().ok()
    }

    /// Overlay caller-chosen identify fields (shard, compression, presence).
    pub async fn set_identify_options(&self, overlay: IdentifyOverlay) {
        *self.overlay.write().await = overlay;
    }

    /// Queue an outbound command. Passes through the send quota; when the
    /// window is exhausted the call suspends until it reopens.
    pub async fn send(&self, op: Opcode, payload: Value) -> Result<()> {
        self.quota.acquire().await;
        self.outbound_tx
            .send(OutboundFrame::new(op, payload))
            .map_err(|_| GatewayError::Shutdown)
    }

    /// Send a presence update for the current user.
    pub async fn update_presence(&self, presence: PresenceUpdate) -> Result<()> {
        self.send(Opcode::PresenceUpdate, serde_json::to_value(presence)?)
            .await
    }

    /// Stop the session. Cancels the heartbeat and any pending reconnect
    /// timer; a caller-initiated shutdown never attempts a resume.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the session until shutdown.
    ///
    /// Fails fast when no credential is present. Transport and protocol
    /// errors never surface here; they drive reconnects and are visible
    /// through the debug sink and the session state.
    pub async fn connect(&self) -> Result<()> {
        if self.token.raw().is_none() {
            return Err(GatewayError::MissingToken);
        }

        // One connection loop at a time. The receiver is taken for the life
        // of the loop; shutdown is terminal so it is never put back.
        let mut rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or(GatewayError::AlreadyConnected)?;

        let mut resuming = false;
        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            self.set_phase(if resuming {
                ConnectionPhase::Resuming
            } else {
                ConnectionPhase::Connecting
            })
            .await;

            let url = format!("{}/?v={}&encoding=json", self.options.url, self.options.version);
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                attempt = connect_async(&url) => match attempt {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        warn!(%error, "gateway connection attempt failed");
                        self.sink.emit(DebugEvent::Gateway {
                            message: format!("connection attempt failed: {}", error),
                        });
                        resuming = self.prepare_reconnect().await;
                        // Back off before redialing; cancellable.
                        tokio::select! {
                            _ = self.cancel.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(self.options.reconnect_delay) => continue,
                        }
                    }
                },
            };

            self.set_phase(ConnectionPhase::AwaitingHello).await;
            self.sink.emit(DebugEvent::Gateway {
                message: "connection established".to_string(),
            });

            match self.drive(stream, &mut rx, resuming).await {
                Outcome::Shutdown => break Ok(()),
                Outcome::Reconnect => {
                    resuming = self.prepare_reconnect().await;
                }
            }
        };

        self.set_phase(ConnectionPhase::Disconnected).await;
        result
    }

    /// Decide between resuming and a fresh handshake after a disconnect.
    /// Resets the session when either resume ingredient is missing.
    async fn prepare_reconnect(&self) -> bool {
        let mut state = self.state.write().await;
        if state.resumable() {
            state.phase = ConnectionPhase::Resuming;
            true
        } else {
            state.reset();
            state.phase = ConnectionPhase::Connecting;
            false
        }
    }

    /// Run one live connection until it ends.
    async fn drive(
        &self,
        stream: WsStream,
        rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
        resuming: bool,
    ) -> Outcome {
        let (mut writer, mut reader) = stream.split();
        let mut heartbeat: Option<Interval> = None;
        let mut identify_delay: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = writer.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                }

                message = reader.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<InboundFrame>(&text) {
                                Ok(frame) => {
                                    match self
                                        .handle_frame(frame, &mut writer, &mut heartbeat, &mut identify_delay, resuming)
                                        .await
                                    {
                                        Ok(true) => {}
                                        Ok(false) => return Outcome::Reconnect,
                                        Err(error) => {
                                            warn!(%error, "gateway frame handling failed, reconnecting");
                                            self.sink.emit(DebugEvent::Gateway {
                                                message: format!("protocol error: {}", error),
                                            });
                                            return Outcome::Reconnect;
                                        }
                                    }
                                }
                                Err(error) => {
                                    warn!(%error, "malformed gateway payload, reconnecting");
                                    self.sink.emit(DebugEvent::Gateway {
                                        message: format!("malformed payload: {}", error),
                                    });
                                    return Outcome::Reconnect;
                                }
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            self.sink.emit(DebugEvent::Gateway {
                                message: format!("connection closed: {:?}", frame),
                            });
                            return Outcome::Reconnect;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if writer.send(Message::Pong(payload)).await.is_err() {
                                return Outcome::Reconnect;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            warn!(%error, "gateway transport error, reconnecting");
                            return Outcome::Reconnect;
                        }
                        None => return Outcome::Reconnect,
                    }
                }

                _ = async { heartbeat.as_mut().expect("guarded by arm condition").tick().await },
                    if heartbeat.is_some() =>
                {
                    if self.send_heartbeat(&mut writer).await.is_err() {
                        return Outcome::Reconnect;
                    }
                }

                _ = async { identify_delay.as_mut().expect("guarded by arm condition").await },
                    if identify_delay.is_some() =>
                {
                    identify_delay = None;
                    if self.send_identify(&mut writer).await.is_err() {
                        return Outcome::Reconnect;
                    }
                }

                queued = rx.recv() => {
                    match queued {
                        Some(frame) => {
                            if self.write_frame(&mut writer, frame).await.is_err() {
                                return Outcome::Reconnect;
                            }
                        }
                        None => return Outcome::Shutdown,
                    }
                }
            }
        }
    }

    /// Process one inbound frame. Returns `Ok(false)` when the server asked
    /// for a reconnect.
    async fn handle_frame(
        &self,
        frame: InboundFrame,
        writer: &mut WsWriter,
        heartbeat: &mut Option<Interval>,
        identify_delay: &mut Option<Pin<Box<Sleep>>>,
        resuming: bool,
    ) -> Result<bool> {
        if let Some(sequence) = frame.s {
            self.state.write().await.sequence = Some(sequence);
        }

        let op = match Opcode::try_from(frame.op) {
            Ok(op) => op,
            Err(_) => {
                debug!(op = frame.op, "ignoring unknown gateway opcode");
                return Ok(true);
            }
        };

        match op {
            Opcode::Dispatch => {
                let name = frame
                    .t
                    .ok_or_else(|| GatewayError::Protocol("dispatch without event name".into()))?;
                let payload = frame.d.unwrap_or(Value::Null);
                if name == "READY" {
                    if let Some(session_id) = payload.get("session_id").and_then(Value::as_str) {
                        self.state.write().await.session_id = Some(session_id.to_string());
                    }
                }
                // Write-through before dispatch so handlers see a fresh cache.
                self.cache.apply(&name, &payload);
                self.events.dispatch(&name, payload);
            }
            Opcode::Hello => {
                let hello: Hello = serde_json::from_value(
                    frame
                        .d
                        .ok_or_else(|| GatewayError::Protocol("hello without payload".into()))?,
                )?;
                let interval = Duration::from_millis(hello.heartbeat_interval);
                let can_resume = {
                    let mut state = self.state.write().await;
                    state.heartbeat_interval = Some(interval);
                    state.phase = ConnectionPhase::Identifying;
                    resuming && state.resumable()
                };

                // Heartbeating starts immediately; the first tick fires now
                // and every `interval` thereafter.
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                *heartbeat = Some(ticker);

                if can_resume {
                    self.send_resume(writer).await?;
                } else {
                    self.send_identify(writer).await?;
                }
                self.state.write().await.phase = ConnectionPhase::Connected;
            }
            Opcode::HeartbeatAck => {
                let ping = {
                    let now = Utc::now();
                    let mut state = self.state.write().await;
                    state.last_heartbeat_ack = Some(now);
                    state.last_heartbeat_sent.map(|sent| now - sent)
                };
                debug!(ping_ms = ping.map(|p| p.num_milliseconds()), "heartbeat acknowledged");
            }
            Opcode::InvalidSession => {
                // Delayed re-identify instead of hammering the handshake.
                self.sink.emit(DebugEvent::Gateway {
                    message: format!(
                        "invalid session, re-identifying in {:?}",
                        self.options.invalid_session_delay
                    ),
                });
                *identify_delay =
                    Some(Box::pin(tokio::time::sleep(self.options.invalid_session_delay)));
            }
            Opcode::Reconnect => {
                self.sink.emit(DebugEvent::Gateway {
                    message: "server requested reconnect".to_string(),
                });
                return Ok(false);
            }
            Opcode::Heartbeat | Opcode::Identify | Opcode::PresenceUpdate | Opcode::Resume => {
                debug!(?op, "ignoring unexpected inbound opcode");
            }
        }

        Ok(true)
    }

    async fn write_frame(&self, writer: &mut WsWriter, frame: OutboundFrame) -> Result<()> {
        let json = serde_json::to_string(&frame)?;
        writer.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Quota-gated send for frames originated inside the session loop.
    async fn send_frame(&self, writer: &mut WsWriter, frame: OutboundFrame) -> Result<()> {
        self.quota.acquire().await;
        self.write_frame(writer, frame).await
    }

    async fn send_heartbeat(&self, writer: &mut WsWriter) -> Result<()> {
        let sequence = self.state.read().await.sequence;
        self.send_frame(writer, OutboundFrame::heartbeat(sequence))
            .await?;
        self.state.write().await.last_heartbeat_sent = Some(Utc::now());
        Ok(())
    }

    async fn send_identify(&self, writer: &mut WsWriter) -> Result<()> {
        let token = self.token.raw().ok_or(GatewayError::MissingToken)?;
        let overlay = self.overlay.read().await.clone();
        let identify = Identify {
            token,
            properties: self.options.properties.clone(),
            intents: self.options.intents,
            compress: overlay.compress,
            large_threshold: overlay.large_threshold,
            shard: overlay.shard,
            presence: overlay.presence.or_else(|| self.options.presence.clone()),
        };
        self.sink.emit(DebugEvent::Gateway {
            message: "identifying".to_string(),
        });
        self.send_frame(
            writer,
            OutboundFrame::new(Opcode::Identify, serde_json::to_value(&identify)?),
        )
        .await
    }

    async fn send_resume(&self, writer: &mut WsWriter) -> Result<()> {
        let token = self.token.raw().ok_or(GatewayError::MissingToken)?;
        let (session_id, seq) = {
            let state = self.state.read().await;
            match (state.session_id.clone(), state.sequence) {
                (Some(session_id), Some(seq)) => (session_id, seq),
                // Lost an ingredient between the decision and now.
                _ => return self.send_identify(writer).await,
            }
        };
        self.sink.emit(DebugEvent::Gateway {
            message: format!("resuming from sequence {}", seq),
        });
        self.send_frame(
            writer,
            OutboundFrame::new(
                Opcode::Resume,
                serde_json::to_value(Resume {
                    token,
                    session_id,
                    seq,
                })?,
            ),
        )
        .await
    }

    async fn set_phase(&self, phase: ConnectionPhase) {
        self.state.write().await.phase = phase;
    }
}

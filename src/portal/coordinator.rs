//! Coordinator: wires relay events to peer-session actions and exposes the
//! facade the embedding application talks to.
//!
//! One `PortalManager` per room. Its `run` loop owns the relay WebSocket,
//! the peer session, the transfer engine and all timers, so session and
//! engine state never need locking. The paired `PortalHandle` observes
//! status and history through shared snapshots and injects commands over a
//! channel, mirroring the manager/handle split used elsewhere in the crate.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use super::session::{CloseOutcome, PeerSession};
use super::transfer::{
    InboundOutcome, OutboundFile, PumpOutcome, TransferEngine, TransferItem, HEARTBEAT,
};
use super::transport::{TransportEvent, TransportFactory};
use crate::config::Config;
use crate::error::{PortalError, Result};
use crate::wire::{ClientEvent, ServerEvent, SignalPayload};

use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Facade status derived from the session and the transfer engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalStatus {
    Idle,
    WaitingForPeer,
    Connected,
    Transferring,
    Completed,
    Error,
}

/// Lexicographically smaller participant id initiates the connection.
/// Deterministic and collision-free without extra negotiation.
pub fn should_initiate(my_id: &str, peer_id: &str) -> bool {
    my_id < peer_id
}

enum PortalCommand {
    SendFile(OutboundFile),
    Shutdown,
}

#[derive(Debug, Default)]
pub struct PortalState {
    status: RwLock<Option<PortalStatus>>,
    history: RwLock<Vec<TransferItem>>,
    participant_id: RwLock<Option<String>>,
}

/// Cloneable facade for one room. All reads are snapshots.
#[derive(Clone)]
pub struct PortalHandle {
    commands: mpsc::Sender<PortalCommand>,
    state: Arc<PortalState>,
}

impl PortalHandle {
    pub async fn send_file(&self, file: OutboundFile) {
        let _ = self.commands.send(PortalCommand::SendFile(file)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(PortalCommand::Shutdown).await;
    }

    pub async fn status(&self) -> PortalStatus {
        (*self.state.status.read().await).unwrap_or(PortalStatus::Idle)
    }

    /// Transfer ledger snapshot, most recent first.
    pub async fn history(&self) -> Vec<TransferItem> {
        self.state.history.read().await.clone()
    }

    /// Own relay-assigned id, once the welcome event has arrived.
    pub async fn participant_id(&self) -> Option<String> {
        self.state.participant_id.read().await.clone()
    }
}

struct RetryMsg {
    target: String,
    initiator: bool,
    generation: u64,
}

pub struct PortalManager {
    relay_url: String,
    room_key: String,
    config: Config,
    factory: Arc<dyn TransportFactory>,
    state: Arc<PortalState>,
    command_rx: mpsc::Receiver<PortalCommand>,
}

impl PortalManager {
    pub fn new(
        relay_url: impl Into<String>,
        room_key: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        config: Config,
    ) -> (Self, PortalHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let state = Arc::new(PortalState::default());

        let manager = Self {
            relay_url: relay_url.into(),
            room_key: room_key.into(),
            config,
            factory,
            state: state.clone(),
            command_rx,
        };
        let handle = PortalHandle {
            commands: command_tx,
            state,
        };
        (manager, handle)
    }

    /// Connect to the relay, join the room and drive the session until
    /// shutdown or a fatal signaling failure.
    pub async fn run(mut self) -> Result<()> {
        info!("Connecting to relay at {}", self.relay_url);
        let (ws, _) = connect_async(&self.relay_url)
            .await
            .map_err(|e| PortalError::Signaling(e.to_string()))?;
        let (ws_tx, mut ws_rx) = ws.split();

        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();

        let mut driver = Driver {
            my_id: None,
            session: PeerSession::new(
                self.factory.clone(),
                transport_tx,
                self.config.session.max_retries,
            ),
            engine: TransferEngine::new(self.config.transfer.chunk_size),
            ws_tx,
            state: self.state.clone(),
            retry_tx,
            generation: 0,
            backoff: self.config.session.retry_backoff(),
        };

        driver
            .send_event(&ClientEvent::JoinRoom {
                room_key: self.room_key.clone(),
            })
            .await?;
        driver.set_status(PortalStatus::WaitingForPeer).await;

        let mut heartbeat = tokio::time::interval(self.config.session.heartbeat_interval());
        let mut watchdog = tokio::time::interval(self.config.session.watchdog_interval());
        let liveness_timeout = self.config.session.liveness_timeout();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            driver.handle_relay_text(&text).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Relay connection closed");
                            driver.set_status(PortalStatus::Error).await;
                            return Err(PortalError::Signaling("relay connection closed".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            driver.set_status(PortalStatus::Error).await;
                            return Err(PortalError::Signaling(e.to_string()));
                        }
                    }
                }
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(PortalCommand::SendFile(file)) => driver.handle_send_file(file).await,
                        Some(PortalCommand::Shutdown) | None => {
                            info!("Shutting down portal for room {}", self.room_key);
                            driver.teardown().await;
                            return Ok(());
                        }
                    }
                }
                Some(event) = transport_rx.recv() => {
                    driver.handle_transport_event(event).await?;
                }
                Some(msg) = retry_rx.recv() => {
                    driver.handle_retry(msg).await;
                }
                _ = heartbeat.tick() => {
                    driver.on_heartbeat_tick();
                }
                _ = watchdog.tick() => {
                    driver.on_watchdog_tick(liveness_timeout).await;
                }
            }
        }
    }
}

struct Driver {
    my_id: Option<String>,
    session: PeerSession,
    engine: TransferEngine,
    ws_tx: WsSink,
    state: Arc<PortalState>,
    retry_tx: mpsc::UnboundedSender<RetryMsg>,
    /// Bumped on every intentional teardown so in-flight backoff sleepers
    /// cannot resurrect a destroyed session.
    generation: u64,
    backoff: Duration,
}

impl Driver {
    async fn send_event(&mut self, event: &ClientEvent) -> Result<()> {
        let json =
            serde_json::to_string(event).map_err(|e| PortalError::Signaling(e.to_string()))?;
        self.ws_tx
            .send(Message::Text(json))
            .await
            .map_err(|e| PortalError::Signaling(e.to_string()))
    }

    // These take &mut self: a shared borrow held across the await would
    // require Driver to be Sync, which its boxed transport is not.
    async fn set_status(&mut self, status: PortalStatus) {
        *self.state.status.write().await = Some(status);
    }

    async fn sync_history(&mut self) {
        *self.state.history.write().await = self.engine.history().to_vec();
    }

    async fn handle_relay_text(&mut self, text: &str) -> Result<()> {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(ev) => ev,
            Err(e) => {
                debug!("Ignoring malformed relay event: {}", e);
                return Ok(());
            }
        };
        debug!("Relay event: {}", event.event_type());

        match event {
            ServerEvent::Welcome { participant_id } => {
                info!("Assigned participant id {}", participant_id);
                *self.state.participant_id.write().await = Some(participant_id.clone());
                self.my_id = Some(participant_id);
            }
            ServerEvent::UserConnected { participant_id } => {
                self.on_user_connected(&participant_id);
            }
            ServerEvent::UserDisconnected { participant_id } => {
                self.on_user_disconnected(&participant_id).await;
            }
            ServerEvent::Offer(payload) => {
                // A remote offer may arrive before user-connected does
                if !self.session.is_active() {
                    match payload.sender_id.as_deref() {
                        Some(sender) => self.session.create(sender, false),
                        None => {
                            warn!("Offer without senderId, dropping");
                            return Ok(());
                        }
                    }
                }
                if let Some(sdp) = payload.sdp {
                    self.session.signal(sdp);
                }
            }
            ServerEvent::Answer(payload) => {
                if let Some(sdp) = payload.sdp {
                    self.session.signal(sdp);
                }
            }
            ServerEvent::IceCandidate(payload) => {
                if let Some(candidate) = payload.candidate {
                    self.session.signal(candidate);
                }
            }
        }
        Ok(())
    }

    fn on_user_connected(&mut self, peer_id: &str) {
        if self.session.is_active() {
            debug!("Session already active, ignoring user-connected({})", peer_id);
            return;
        }
        let Some(my_id) = self.my_id.clone() else {
            warn!("user-connected before welcome, ignoring");
            return;
        };
        let initiator = should_initiate(&my_id, peer_id);
        info!("Peer {} discovered, initiator: {}", peer_id, initiator);
        self.session.create(peer_id, initiator);
    }

    async fn on_user_disconnected(&mut self, peer_id: &str) {
        if self.session.target() != Some(peer_id) {
            return;
        }
        info!("Peer {} left the room", peer_id);
        self.abort_active_transfer().await;
        self.session.destroy();
        self.generation += 1;
        self.set_status(PortalStatus::WaitingForPeer).await;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Signal(body) => self.relay_signal(body).await?,
            TransportEvent::Connected => {
                self.session.on_transport_connected();
                self.set_status(PortalStatus::Connected).await;
            }
            TransportEvent::Data(frame) => {
                self.session.note_liveness();
                if frame.as_ref() == HEARTBEAT {
                    return Ok(());
                }
                match self.engine.on_inbound_frame(frame) {
                    InboundOutcome::Started(_) => {
                        self.set_status(PortalStatus::Transferring).await;
                    }
                    InboundOutcome::Completed(_) => {
                        self.set_status(PortalStatus::Completed).await;
                    }
                    InboundOutcome::Chunk { .. } | InboundOutcome::Ignored => {}
                }
                self.sync_history().await;
            }
            TransportEvent::Drain => self.pump().await,
            TransportEvent::Closed => {
                let outcome = self.session.on_transport_closed();
                self.handle_close_outcome(outcome).await;
            }
            TransportEvent::Error(message) => {
                // Session-fatal but recoverable: same teardown and retry
                // path as a liveness timeout
                self.session.on_transport_error(&message);
                let outcome = self.session.fail_fatal();
                self.handle_close_outcome(outcome).await;
            }
        }
        Ok(())
    }

    /// Classify a locally generated negotiation body and relay it onward.
    async fn relay_signal(&mut self, body: Value) -> Result<()> {
        let Some(target) = self.session.target().map(String::from) else {
            warn!("Transport signal with no session target, dropping");
            return Ok(());
        };
        let my_id = self.my_id.clone().unwrap_or_default();

        let event = match body.get("type").and_then(Value::as_str) {
            Some("offer") => ClientEvent::Offer(SignalPayload::sdp(&target, &my_id, body)),
            Some("answer") => ClientEvent::Answer(SignalPayload::sdp(&target, &my_id, body)),
            _ => ClientEvent::IceCandidate(SignalPayload::candidate(&target, &my_id, body)),
        };
        self.send_event(&event).await
    }

    async fn handle_send_file(&mut self, file: OutboundFile) {
        if !self.session.is_connected() {
            warn!("sendFile while not connected, recording failed item");
            self.engine.record_rejected(file);
            self.set_status(PortalStatus::Error).await;
            self.sync_history().await;
            return;
        }

        if self.engine.has_outbound() {
            // Refused sends still land in the ledger so the caller can see
            // that the file was dropped
            warn!("{}", PortalError::SendInProgress);
            self.engine.record_rejected(file);
            self.sync_history().await;
            return;
        }

        match self.engine.start_send(file) {
            Ok(_) => {
                self.set_status(PortalStatus::Transferring).await;
                self.pump().await;
            }
            Err(e) => warn!("Send rejected: {}", e),
        }
    }

    async fn pump(&mut self) {
        let session = &mut self.session;
        let result = self.engine.pump_outbound(|frame| session.send_frame(frame));
        match result {
            Ok(PumpOutcome::Finished(_)) => self.set_status(PortalStatus::Completed).await,
            Ok(PumpOutcome::Suspended) | Ok(PumpOutcome::Idle) => {}
            Err(e) => {
                warn!("Send failed: {}", e);
                self.set_status(PortalStatus::Error).await;
            }
        }
        self.sync_history().await;
    }

    fn on_heartbeat_tick(&mut self) {
        if self.session.is_connected() {
            if let Err(e) = self.session.send_frame(Bytes::from_static(HEARTBEAT)) {
                debug!("Heartbeat send failed: {}", e);
            }
        }
    }

    async fn on_watchdog_tick(&mut self, timeout: Duration) {
        if self.session.silence_exceeded(timeout) {
            warn!("{}", PortalError::ConnectionTimeout);
            let outcome = self.session.fail_fatal();
            self.handle_close_outcome(outcome).await;
        }
    }

    async fn handle_close_outcome(&mut self, outcome: CloseOutcome) {
        match outcome {
            CloseOutcome::Shutdown => {}
            CloseOutcome::Retry { target, initiator } => {
                self.abort_active_transfer().await;
                self.set_status(PortalStatus::WaitingForPeer).await;
                let tx = self.retry_tx.clone();
                let generation = self.generation;
                let backoff = self.backoff;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(RetryMsg {
                        target,
                        initiator,
                        generation,
                    });
                });
            }
            CloseOutcome::Lost => {
                warn!("{}", PortalError::ConnectionLost);
                self.abort_active_transfer().await;
                self.set_status(PortalStatus::Error).await;
            }
        }
    }

    async fn handle_retry(&mut self, msg: RetryMsg) {
        if msg.generation != self.generation {
            debug!("Dropping stale reconnection attempt");
            return;
        }
        info!("Reconnecting to {}", msg.target);
        self.session.create(&msg.target, msg.initiator);
    }

    /// A dropped connection aborts the in-flight outbound item; transfers
    /// do not resume across reconnects.
    async fn abort_active_transfer(&mut self) {
        if let Some(id) = self.engine.active_outbound() {
            self.engine.fail_item(id);
            self.sync_history().await;
        }
    }

    async fn teardown(&mut self) {
        self.abort_active_transfer().await;
        self.session.destroy();
        self.generation += 1;
        self.set_status(PortalStatus::Idle).await;
        let _ = self.ws_tx.close().await;
    }
}

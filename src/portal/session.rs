//! Peer session state machine.
//!
//! One session per room membership, owning at most one live transport
//! instance. All methods are synchronous and driven from the coordinator's
//! single event loop, so the session needs no internal locking; timers
//! (heartbeat, watchdog, reconnection backoff) also live in that loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{Transport, TransportEvent, TransportFactory};
use crate::error::{PortalError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Error,
}

/// What the coordinator must do after a transport closure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Intentional teardown (or a stale close after one); nothing to do.
    Shutdown,
    /// Unintentional drop within the retry budget: re-create the session
    /// with the same target and role after the fixed backoff.
    Retry { target: String, initiator: bool },
    /// Retries exhausted or no target known; the session is terminally lost.
    Lost,
}

pub struct PeerSession {
    status: SessionStatus,
    target_id: Option<String>,
    is_initiator: bool,
    retry_count: u32,
    max_retries: u32,
    last_liveness: Instant,
    pending_signals: VecDeque<Value>,
    transport: Option<Box<dyn Transport>>,
    /// True while a transport is expected but not yet installed (the
    /// reconnection backoff window); inbound signals queue instead of drop.
    reconnecting: bool,
    intentional_close: bool,
    factory: Arc<dyn TransportFactory>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl PeerSession {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        events: mpsc::UnboundedSender<TransportEvent>,
        max_retries: u32,
    ) -> Self {
        Self {
            status: SessionStatus::Idle,
            target_id: None,
            is_initiator: false,
            retry_count: 0,
            max_retries,
            last_liveness: Instant::now(),
            pending_signals: VecDeque::new(),
            transport: None,
            reconnecting: false,
            intentional_close: false,
            factory,
            events,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == SessionStatus::Connected
    }

    pub fn target(&self) -> Option<&str> {
        self.target_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// A session is active while it owns a transport or is between
    /// transports waiting for a reconnection attempt.
    pub fn is_active(&self) -> bool {
        self.transport.is_some() || self.reconnecting
    }

    /// Create the transport for `target_id`. No-op if one already exists.
    pub fn create(&mut self, target_id: &str, initiator: bool) {
        if self.transport.is_some() {
            debug!("Transport already exists, skipping create");
            return;
        }

        info!(
            "Creating session - target: {}, initiator: {}",
            target_id, initiator
        );

        self.target_id = Some(target_id.to_string());
        self.is_initiator = initiator;
        self.intentional_close = false;
        self.status = SessionStatus::Connecting;

        let transport = self.factory.create(initiator, self.events.clone());
        self.transport = Some(transport);
        self.reconnecting = false;

        // Negotiation bodies that raced ahead of transport creation
        self.flush_pending();
    }

    /// Mark the backoff window before a reconnection attempt so that
    /// negotiation messages arriving meanwhile are queued, not dropped.
    pub fn mark_reconnecting(&mut self) {
        self.reconnecting = true;
        self.status = SessionStatus::Connecting;
    }

    /// Dispatch a negotiation body from the relay.
    pub fn signal(&mut self, body: Value) {
        if let Some(transport) = self.transport.as_mut() {
            if let Err(e) = transport.signal(&body) {
                warn!("Failed to signal transport: {}", e);
            }
        } else if self.reconnecting || self.status == SessionStatus::Connecting {
            debug!("Transport not ready, queueing signal");
            self.pending_signals.push_back(body);
        } else {
            warn!("Received signal but no session exists, dropping");
        }
    }

    fn flush_pending(&mut self) {
        if self.pending_signals.is_empty() {
            return;
        }
        debug!("Flushing {} pending signal(s)", self.pending_signals.len());
        while let Some(body) = self.pending_signals.pop_front() {
            if let Some(transport) = self.transport.as_mut() {
                if let Err(e) = transport.signal(&body) {
                    warn!("Failed to flush pending signal: {}", e);
                }
            }
        }
    }

    pub fn on_transport_connected(&mut self) {
        info!("Peer session connected");
        self.status = SessionStatus::Connected;
        self.retry_count = 0;
        self.last_liveness = Instant::now();
        self.flush_pending();
    }

    /// A fatal transport fault. Does not by itself trigger reconnection;
    /// the closure that follows drives the retry policy.
    pub fn on_transport_error(&mut self, message: &str) {
        warn!("Transport error: {}", message);
        self.status = SessionStatus::Error;
    }

    /// The transport reported closed. Decides between shutdown, a bounded
    /// reconnection attempt (same target, same role) and terminal loss.
    pub fn on_transport_closed(&mut self) -> CloseOutcome {
        if self.transport.take().is_none() {
            // Stale close after an explicit teardown
            return CloseOutcome::Shutdown;
        }

        if self.intentional_close {
            self.status = SessionStatus::Idle;
            return CloseOutcome::Shutdown;
        }

        self.close_fallout()
    }

    /// Session-fatal fault (liveness timeout or a fatal transport error):
    /// tear the transport down and fall into the same recovery path as an
    /// unintentional closure.
    pub fn fail_fatal(&mut self) -> CloseOutcome {
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.close_fallout()
    }

    fn close_fallout(&mut self) -> CloseOutcome {
        match self.target_id.clone() {
            Some(target) if self.retry_count < self.max_retries => {
                self.retry_count += 1;
                self.mark_reconnecting();
                info!(
                    "Connection dropped, retry {}/{} to {}",
                    self.retry_count, self.max_retries, target
                );
                CloseOutcome::Retry {
                    target,
                    initiator: self.is_initiator,
                }
            }
            _ => {
                self.status = SessionStatus::Error;
                CloseOutcome::Lost
            }
        }
    }

    /// Tear everything down and return to idle. Idempotent.
    pub fn destroy(&mut self) {
        self.intentional_close = true;
        if let Some(mut transport) = self.transport.take() {
            transport.destroy();
        }
        self.target_id = None;
        self.pending_signals.clear();
        self.retry_count = 0;
        self.reconnecting = false;
        self.status = SessionStatus::Idle;
    }

    /// Write one frame through the transport.
    /// `Ok(false)` signals backpressure: wait for a drain event.
    pub fn send_frame(&mut self, frame: Bytes) -> Result<bool> {
        match self.transport.as_mut() {
            Some(transport) => transport.send(frame),
            None => Err(PortalError::NotConnected),
        }
    }

    /// Any inbound payload (heartbeat or data) counts as liveness.
    pub fn note_liveness(&mut self) {
        self.last_liveness = Instant::now();
    }

    /// The timeout is a pure silence detector: only meaningful while
    /// connected.
    pub fn silence_exceeded(&self, timeout: Duration) -> bool {
        self.status == SessionStatus::Connected && self.last_liveness.elapsed() >= timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockShared {
        signals: Mutex<Vec<Value>>,
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    struct MockTransport {
        shared: Arc<MockShared>,
    }

    impl Transport for MockTransport {
        fn signal(&mut self, body: &Value) -> Result<()> {
            self.shared.signals.lock().unwrap().push(body.clone());
            Ok(())
        }

        fn send(&mut self, _frame: Bytes) -> Result<bool> {
            Ok(true)
        }

        fn destroy(&mut self) {
            self.shared.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct MockFactory {
        shared: Arc<MockShared>,
    }

    impl TransportFactory for MockFactory {
        fn create(
            &self,
            _initiator: bool,
            _events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Box<dyn Transport> {
            self.shared.created.fetch_add(1, Ordering::SeqCst);
            Box::new(MockTransport {
                shared: self.shared.clone(),
            })
        }
    }

    fn new_session(max_retries: u32) -> (PeerSession, Arc<MockShared>) {
        let shared = Arc::new(MockShared::default());
        let factory = Arc::new(MockFactory {
            shared: shared.clone(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        (PeerSession::new(factory, tx, max_retries), shared)
    }

    #[test]
    fn test_create_is_noop_when_transport_exists() {
        let (mut session, shared) = new_session(5);
        session.create("peer", true);
        session.create("peer", true);
        assert_eq!(shared.created.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[test]
    fn test_pending_signals_flushed_in_fifo_order() {
        let (mut session, shared) = new_session(5);
        session.mark_reconnecting();
        session.signal(json!({"seq": 1}));
        session.signal(json!({"seq": 2}));
        session.signal(json!({"seq": 3}));
        assert!(shared.signals.lock().unwrap().is_empty());

        session.create("peer", false);
        let signals = shared.signals.lock().unwrap();
        assert_eq!(signals.len(), 3);
        assert_eq!(signals[0]["seq"], 1);
        assert_eq!(signals[1]["seq"], 2);
        assert_eq!(signals[2]["seq"], 3);
    }

    #[test]
    fn test_signal_with_transport_forwards_immediately() {
        let (mut session, shared) = new_session(5);
        session.create("peer", true);
        session.signal(json!({"type": "answer"}));
        assert_eq!(shared.signals.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_signal_without_session_is_dropped() {
        let (mut session, shared) = new_session(5);
        session.signal(json!({"type": "offer"}));
        assert!(shared.signals.lock().unwrap().is_empty());
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (mut session, shared) = new_session(5);
        session.create("peer", true);
        session.destroy();

        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.target(), None);
        assert_eq!(session.retry_count(), 0);
        assert!(!session.is_active());

        session.destroy();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(shared.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_after_destroy_is_shutdown() {
        let (mut session, _shared) = new_session(5);
        session.create("peer", true);
        session.destroy();
        // The destroyed transport's close event arrives late
        assert_eq!(session.on_transport_closed(), CloseOutcome::Shutdown);
    }

    #[test]
    fn test_reconnection_bound() {
        let (mut session, _shared) = new_session(5);
        session.create("peer", true);

        for attempt in 1..=5 {
            let outcome = session.on_transport_closed();
            assert_eq!(
                outcome,
                CloseOutcome::Retry {
                    target: "peer".to_string(),
                    initiator: true
                },
                "closure {} should retry",
                attempt
            );
            assert_eq!(session.retry_count(), attempt);
            session.create("peer", true);
        }

        // Sixth consecutive closure exhausts the budget
        assert_eq!(session.on_transport_closed(), CloseOutcome::Lost);
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[test]
    fn test_retry_preserves_initiator_role() {
        let (mut session, _shared) = new_session(5);
        session.create("peer", false);
        match session.on_transport_closed() {
            CloseOutcome::Retry { target, initiator } => {
                assert_eq!(target, "peer");
                assert!(!initiator);
            }
            other => panic!("Expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_connected_resets_retry_budget() {
        let (mut session, _shared) = new_session(5);
        session.create("peer", true);
        assert!(matches!(
            session.on_transport_closed(),
            CloseOutcome::Retry { .. }
        ));
        assert_eq!(session.retry_count(), 1);

        session.create("peer", true);
        session.on_transport_connected();
        assert_eq!(session.retry_count(), 0);
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[test]
    fn test_timeout_drives_retry_policy() {
        let (mut session, shared) = new_session(5);
        session.create("peer", true);
        session.on_transport_connected();

        let outcome = session.fail_fatal();
        assert!(matches!(outcome, CloseOutcome::Retry { .. }));
        assert_eq!(shared.destroyed.load(Ordering::SeqCst), 1);
        // The destroyed transport's own close event is now stale
        assert_eq!(session.on_transport_closed(), CloseOutcome::Shutdown);
    }

    #[test]
    fn test_fatal_transport_fault_recovers_via_retry() {
        let (mut session, shared) = new_session(5);
        session.create("peer", false);
        session.on_transport_connected();

        session.on_transport_error("data channel fault");
        assert_eq!(session.status(), SessionStatus::Error);

        // The fault is session-fatal but recoverable: teardown plus retry
        match session.fail_fatal() {
            CloseOutcome::Retry { target, initiator } => {
                assert_eq!(target, "peer");
                assert!(!initiator);
            }
            other => panic!("Expected retry, got {:?}", other),
        }
        assert_eq!(shared.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(session.is_active());
    }

    #[test]
    fn test_silence_detector_only_while_connected() {
        let (mut session, _shared) = new_session(5);
        assert!(!session.silence_exceeded(Duration::ZERO));

        session.create("peer", true);
        session.on_transport_connected();
        assert!(session.silence_exceeded(Duration::ZERO));
        assert!(!session.silence_exceeded(Duration::from_secs(3600)));
    }

    #[test]
    fn test_send_frame_without_transport_fails() {
        let (mut session, _shared) = new_session(5);
        let err = session.send_frame(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, PortalError::NotConnected));
    }
}

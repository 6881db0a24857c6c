//! Transport capability: the external point-to-point primitive a peer
//! session drives.
//!
//! The core never constructs a concrete NAT-traversal stack itself; a
//! [`TransportFactory`] is injected at session construction and every
//! transport instance reports back through an event channel. Implementations
//! must provide ordered, reliable byte delivery once negotiation completes.

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Events a transport instance emits toward its owning session.
#[derive(Debug)]
pub enum TransportEvent {
    /// A locally generated negotiation body (offer, answer or candidate)
    /// that must be relayed to the remote peer out-of-band.
    Signal(Value),
    /// The direct channel is established.
    Connected,
    /// An inbound frame (heartbeat or transfer data).
    Data(Bytes),
    /// The outbound buffer drained below its high-water mark; a suspended
    /// sender may resume.
    Drain,
    /// The channel closed, locally or remotely.
    Closed,
    /// A fatal transport fault.
    Error(String),
}

/// One live point-to-point connection.
pub trait Transport: Send {
    /// Feed a negotiation body received from the remote side.
    fn signal(&mut self, body: &Value) -> Result<()>;

    /// Write one frame. `Ok(true)` means the outbound buffer is still below
    /// its high-water mark; `Ok(false)` means the caller must wait for a
    /// [`TransportEvent::Drain`] before sending more.
    fn send(&mut self, frame: Bytes) -> Result<bool>;

    /// Tear the connection down. Must not emit further events afterwards.
    fn destroy(&mut self);
}

/// Creates transport instances. `initiator` decides which side produces the
/// initial offer.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        initiator: bool,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Box<dyn Transport>;
}

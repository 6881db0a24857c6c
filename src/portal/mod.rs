//! Peer-side components: the session state machine, the chunked transfer
//! engine and the coordinator that wires them to the relay.

mod coordinator;
mod session;
mod transfer;
mod transport;

pub use coordinator::{should_initiate, PortalHandle, PortalManager, PortalStatus};
pub use session::{CloseOutcome, PeerSession, SessionStatus};
pub use transfer::{
    decode_metadata, encode_metadata, guess_mime, Direction, InboundOutcome, OutboundFile,
    PumpOutcome, TransferEngine, TransferItem, TransferMeta, TransferStatus, HEARTBEAT,
};
pub use transport::{Transport, TransportEvent, TransportFactory};

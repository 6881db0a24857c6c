//! Error types for portaldrop

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortalError {
    /// A send was attempted without a connected peer session.
    #[error("not connected to a peer")]
    NotConnected,

    /// The underlying transport capability reported a fault.
    #[error("transport error: {0}")]
    Transport(String),

    /// No heartbeat or data observed within the liveness window.
    #[error("connection timed out (no data or heartbeat)")]
    ConnectionTimeout,

    /// Reconnection attempts exhausted; the session is terminally lost.
    #[error("connection lost: reconnection attempts exhausted")]
    ConnectionLost,

    /// A frame arrived that does not fit the current protocol state,
    /// e.g. a binary chunk with no open metadata cursor.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// A file send was requested while another one is still in flight.
    #[error("a file send is already in progress")]
    SendInProgress,

    /// Failure on the relay connection or a malformed wire event.
    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PortalError>;

//! Signaling relay: room membership plus best-effort forwarding of
//! connection-negotiation events. The relay never sees file contents.

mod rooms;
mod server;

pub use rooms::RoomTable;
pub use server::{ws_handler, RelayState};
